//! Cloud-config handler
//!
//! Every cloud-config part of a payload is appended to one document, which
//! is written out when dispatch ends.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Handler, HandlerContext, part_filename};
use crate::InitError;
use crate::state::write_file;
use crate::userdata::Part;

pub const CONTENT_TYPE: &str = "text/cloud-config";

#[derive(Debug, Default)]
pub struct CloudConfigHandler {
    document: String,
    parts: usize,
}

impl CloudConfigHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document accumulated so far
    pub fn document(&self) -> &str {
        &self.document
    }
}

#[async_trait]
impl Handler for CloudConfigHandler {
    fn name(&self) -> &str {
        "cloud-config"
    }

    async fn begin(&mut self, _ctx: &mut HandlerContext) -> Result<(), InitError> {
        self.document.clear();
        self.parts = 0;
        Ok(())
    }

    async fn handle(&mut self, _ctx: &mut HandlerContext, part: &Part) -> Result<(), InitError> {
        let filename = part_filename(part);
        let body = part.text();

        if let Err(e) = serde_yaml::from_str::<serde_yaml::Value>(&body) {
            warn!("Cloud-config part {} is not valid YAML: {}", filename, e);
        }

        self.document.push('\n');
        self.document.push('#');
        self.document.push_str(&filename);
        self.document.push('\n');
        self.document.push_str(&body);
        self.parts += 1;

        debug!("Accumulated cloud-config part {}", filename);
        Ok(())
    }

    async fn end(&mut self, ctx: &mut HandlerContext) -> Result<(), InitError> {
        let path = ctx.paths().cloud_config();
        write_file(&path, self.document.as_bytes(), 0o644).await?;
        info!(
            "Wrote {} cloud-config part(s) to {}",
            self.parts,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_parts_accumulate() {
        let temp = TempDir::new().unwrap();
        let mut ctx = HandlerContext::new(CloudPaths::with_root(temp.path()), "/etc/init");
        let mut handler = CloudConfigHandler::new();

        handler.begin(&mut ctx).await.unwrap();
        let first = Part::new(CONTENT_TYPE, "#cloud-config\nhostname: a\n").with_filename("part-001");
        let second = Part::new(CONTENT_TYPE, "#cloud-config\nlocale: C\n").with_filename("extra");
        handler.handle(&mut ctx, &first).await.unwrap();
        handler.handle(&mut ctx, &second).await.unwrap();
        handler.end(&mut ctx).await.unwrap();

        let written = std::fs::read_to_string(ctx.paths().cloud_config()).unwrap();
        assert_eq!(
            written,
            "\n#part-001\n#cloud-config\nhostname: a\n\n#extra\n#cloud-config\nlocale: C\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_yaml_still_accumulated() {
        let temp = TempDir::new().unwrap();
        let mut ctx = HandlerContext::new(CloudPaths::with_root(temp.path()), "/etc/init");
        let mut handler = CloudConfigHandler::new();

        handler.begin(&mut ctx).await.unwrap();
        let part = Part::new(CONTENT_TYPE, "#cloud-config\nkey: [unclosed\n").with_filename("bad");
        handler.handle(&mut ctx, &part).await.unwrap();

        assert!(handler.document().contains("[unclosed"));
    }

    #[tokio::test]
    async fn test_begin_resets() {
        let temp = TempDir::new().unwrap();
        let mut ctx = HandlerContext::new(CloudPaths::with_root(temp.path()), "/etc/init");
        let mut handler = CloudConfigHandler::new();

        let part = Part::new(CONTENT_TYPE, "#cloud-config\n").with_filename("x");
        handler.handle(&mut ctx, &part).await.unwrap();
        handler.begin(&mut ctx).await.unwrap();
        assert!(handler.document().is_empty());
    }
}
