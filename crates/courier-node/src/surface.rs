use async_trait::async_trait;
use courier_notify::{NotificationSurface, RenderedNotification};
use std::io::Write;

/// Writes notifications to stdout, one line each.
#[derive(Debug, Default)]
pub struct StdoutSurface;

#[async_trait]
impl NotificationSurface for StdoutSurface {
    async fn show(&self, n: &RenderedNotification) -> courier_notify::error::Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "[{}] {}: {}", n.conversation_id, n.title, n.body)?;
        out.flush()?;
        Ok(())
    }
}
