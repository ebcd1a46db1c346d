//! Audit port - 監査ログの書き込み口
//!
//! 保存先（DB テーブル、外部サービス）はこのクレートの外。ここは呼び出し契約だけ。

use async_trait::async_trait;

use crate::domain::AuditEvent;
use crate::error::ConveyorError;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), ConveyorError>;
}
