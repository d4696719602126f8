//! Upstart job handler

use async_trait::async_trait;
use tracing::info;

use super::{Handler, HandlerContext, part_filename};
use crate::InitError;
use crate::state::write_file;
use crate::userdata::Part;

pub const CONTENT_TYPE: &str = "text/upstart-job";

/// Installs parts as `<upstart_dir>/<filename>.conf`
#[derive(Debug, Default)]
pub struct UpstartHandler;

impl UpstartHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for UpstartHandler {
    fn name(&self) -> &str {
        "upstart-job"
    }

    async fn handle(&mut self, ctx: &mut HandlerContext, part: &Part) -> Result<(), InitError> {
        let mut filename = part_filename(part);
        if !filename.ends_with(".conf") {
            filename.push_str(".conf");
        }

        let path = ctx.upstart_dir().join(filename);
        write_file(&path, &part.body, 0o644).await?;
        info!("Installed upstart job {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_job_installed_with_conf_suffix() {
        let temp = TempDir::new().unwrap();
        let init_dir = temp.path().join("etc/init");
        let mut ctx = HandlerContext::new(CloudPaths::with_root(temp.path()), &init_dir);
        let mut handler = UpstartHandler::new();

        let job = Part::new(CONTENT_TYPE, "#upstart-job\nstart on runlevel [2345]\n").with_filename("part-002");
        handler.handle(&mut ctx, &job).await.unwrap();
        let named = Part::new(CONTENT_TYPE, "#upstart-job\n").with_filename("web.conf");
        handler.handle(&mut ctx, &named).await.unwrap();

        assert!(init_dir.join("part-002.conf").exists());
        assert!(init_dir.join("web.conf").exists());
        assert!(!init_dir.join("web.conf.conf").exists());
    }
}
