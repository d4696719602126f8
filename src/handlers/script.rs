//! Shell script handler
//!
//! Scripts are not run here; they are stored executable under the
//! instance's scripts directory and run later by the user-scripts step.

use async_trait::async_trait;
use tracing::info;

use super::{Handler, HandlerContext, part_filename};
use crate::InitError;
use crate::state::write_file;
use crate::userdata::Part;

pub const CONTENT_TYPE: &str = "text/x-shellscript";

#[derive(Debug, Default)]
pub struct ScriptHandler;

impl ScriptHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    fn name(&self) -> &str {
        "shellscript"
    }

    async fn handle(&mut self, ctx: &mut HandlerContext, part: &Part) -> Result<(), InitError> {
        let path = ctx.paths().user_scripts_dir().join(part_filename(part));
        write_file(&path, &part.body, 0o700).await?;
        info!("Stored user script {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_script_stored_executable() {
        let temp = TempDir::new().unwrap();
        let mut ctx = HandlerContext::new(CloudPaths::with_root(temp.path()), temp.path().join("init"));
        let part = Part::new(CONTENT_TYPE, "#!/bin/sh\necho hi\n").with_filename("nested/setup.sh");

        ScriptHandler::new().handle(&mut ctx, &part).await.unwrap();

        let path = ctx.paths().user_scripts_dir().join("nested_setup.sh");
        assert_eq!(std::fs::read(&path).unwrap(), b"#!/bin/sh\necho hi\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
