//! Declarative part handlers
//!
//! A `text/part-handler` part defines a new handler in YAML:
//!
//! ```yaml
//! #part-handler
//! name: motd
//! content_types: [text/x-motd]
//! action: store
//! directory: /etc/motd.d
//! permissions: "0644"
//! ```
//!
//! or, to pipe each part into a program:
//!
//! ```yaml
//! name: importer
//! content_types: [text/x-import]
//! action: command
//! argv: [/usr/local/bin/import, --quiet]
//! ```
//!
//! The defined handler serves every later part of its content types.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{Handler, HandlerContext, part_filename};
use crate::InitError;
use crate::state::{parse_mode, write_file};
use crate::userdata::Part;
use crate::userdata::types::{essence, is_multipart};

pub const CONTENT_TYPE: &str = "text/part-handler";

/// Header line a definition may start with
const MARKER: &str = "#part-handler";

/// Parsed handler definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartHandlerDefinition {
    pub name: String,
    pub content_types: Vec<String>,
    #[serde(flatten)]
    pub action: HandlerAction,
}

/// What a declared handler does with each part
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HandlerAction {
    /// Write the body to `<directory>/<filename>`
    Store {
        directory: PathBuf,
        #[serde(default)]
        permissions: Option<String>,
    },
    /// Pipe the body into a program
    Command { argv: Vec<String> },
}

impl PartHandlerDefinition {
    /// Parse and validate a definition body
    pub fn parse(body: &str) -> Result<Self, InitError> {
        let body = match body.strip_prefix(MARKER) {
            Some(rest) => rest.split_once('\n').map_or("", |(_, rest)| rest),
            None => body,
        };

        let def: Self = serde_yaml::from_str(body)?;

        if def.name.trim().is_empty() {
            return Err(InitError::InvalidData("part-handler without a name".to_string()));
        }
        if def.content_types.is_empty() {
            return Err(InitError::InvalidData(format!(
                "part-handler {} declares no content types",
                def.name
            )));
        }
        if let Some(ct) = def.content_types.iter().find(|ct| is_multipart(ct)) {
            return Err(InitError::InvalidData(format!(
                "part-handler {} cannot handle container type {}",
                def.name, ct
            )));
        }
        match &def.action {
            HandlerAction::Command { argv } if argv.is_empty() => {
                return Err(InitError::InvalidData(format!(
                    "part-handler {} has an empty argv",
                    def.name
                )));
            }
            HandlerAction::Store {
                permissions: Some(perms),
                ..
            } => {
                parse_mode(perms)?;
            }
            _ => {}
        }

        Ok(def)
    }
}

/// Turns `text/part-handler` parts into registered handlers
#[derive(Debug, Default)]
pub struct PartHandlerLoader;

impl PartHandlerLoader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for PartHandlerLoader {
    fn name(&self) -> &str {
        "part-handler"
    }

    async fn handle(&mut self, ctx: &mut HandlerContext, part: &Part) -> Result<(), InitError> {
        let def = PartHandlerDefinition::parse(&part.text())
            .map_err(|e| InitError::handler(self.name(), format!("{}: {e}", part_filename(part))))?;

        info!(
            "Registering part handler {} for {}",
            def.name,
            def.content_types.join(", ")
        );
        let content_types = def.content_types.clone();
        ctx.register(&content_types, Box::new(DeclaredHandler::new(def)));
        Ok(())
    }
}

/// A handler defined by a part-handler part
#[derive(Debug)]
pub struct DeclaredHandler {
    def: PartHandlerDefinition,
    handled: usize,
}

impl DeclaredHandler {
    pub fn new(def: PartHandlerDefinition) -> Self {
        Self { def, handled: 0 }
    }

    async fn store(
        &self,
        directory: &Path,
        permissions: Option<&str>,
        part: &Part,
    ) -> Result<(), InitError> {
        let mode = match permissions {
            Some(perms) => parse_mode(perms)?,
            None => 0o644,
        };
        let path = directory.join(part_filename(part));
        write_file(&path, &part.body, mode).await?;
        debug!("{} stored {}", self.def.name, path.display());
        Ok(())
    }

    async fn run_command(&self, argv: &[String], part: &Part) -> Result<(), InitError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(InitError::Command(format!("{}: empty argv", self.def.name)));
        };

        debug!("Running part handler command: {:?}", argv);
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .env("PART_FILENAME", part_filename(part))
            .env("PART_CONTENT_TYPE", essence(&part.content_type))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| InitError::Command(format!("{program}: {e}")))?;

        // Feed stdin while draining stdout and stderr, or a chatty child
        // blocks on a full pipe
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // A program that exits without reading closes the pipe early
                if let Err(e) = stdin.write_all(&part.body).await {
                    debug!("{} did not read all input: {}", program, e);
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| InitError::Command(format!("{program}: {e}")))?;

        if !output.stdout.is_empty() {
            debug!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "{} exited with status {}: {}",
                program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            return Err(InitError::Command(format!(
                "{program} exited with status {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Handler for DeclaredHandler {
    fn name(&self) -> &str {
        &self.def.name
    }

    async fn handle(&mut self, _ctx: &mut HandlerContext, part: &Part) -> Result<(), InitError> {
        let result = match &self.def.action {
            HandlerAction::Store {
                directory,
                permissions,
            } => self.store(directory, permissions.as_deref(), part).await,
            HandlerAction::Command { argv } => self.run_command(argv, part).await,
        };
        result.map_err(|e| InitError::handler(&self.def.name, e.to_string()))?;

        self.handled += 1;
        Ok(())
    }

    async fn end(&mut self, _ctx: &mut HandlerContext) -> Result<(), InitError> {
        debug!("{} handled {} part(s)", self.def.name, self.handled);
        Ok(())
    }
}
