pub mod notification_dispatch;
pub mod timeout_sweep;
pub mod webhook_retry;
