//! The init stage
//!
//! Responsibilities:
//! - Load system configuration
//! - Resolve the datasource (cache, then discovery)
//! - Track the instance id
//! - Persist raw and decoded user-data
//! - Dispatch user-data to handlers, once per instance
//! - Run user scripts, once per instance

use tracing::{info, warn};

use super::InitContext;
use super::scripts::{self, ScriptsReport};
use crate::InitError;
use crate::config::{InitConfig, load_config};
use crate::datasources::DatasourceRegistry;
use crate::handlers::HandlerRegistry;
use crate::state::{CloudPaths, Frequency};
use crate::userdata::{self, DispatchReport, Node};

/// Gated action names
pub const CONSUME_USER_DATA: &str = "consume-user-data";
pub const USER_SCRIPTS: &str = "user-scripts";

/// What an init run did
#[derive(Debug, Clone, Default)]
pub struct InitOutcome {
    pub datasource: String,
    pub instance_id: String,
    /// Whether this instance id was seen for the first time
    pub new_instance: bool,
    /// `None` when user-data was already consumed for this instance
    pub dispatch: Option<DispatchReport>,
    /// `None` when scripts already ran, or are disabled
    pub scripts: Option<ScriptsReport>,
}

/// Run the init stage with configuration from the config directory
pub async fn run(paths: &CloudPaths, registry: &DatasourceRegistry) -> Result<InitOutcome, InitError> {
    let config = load_config(paths).await?;
    run_with_config(paths.clone(), config, registry).await
}

/// Run the init stage with an explicit configuration
pub async fn run_with_config(
    paths: CloudPaths,
    config: InitConfig,
    registry: &DatasourceRegistry,
) -> Result<InitOutcome, InitError> {
    info!("Init stage: resolving datasource");
    let ctx = InitContext::resolve(paths, config, registry).await?;
    info!(
        "Using datasource {} for instance {}",
        ctx.datasource_name(),
        ctx.instance_id()
    );

    let state = ctx.state();
    let new_instance = state.record_instance(ctx.instance_id()).await?;

    let decoded = userdata::decode_userdata(ctx.raw_user_data());
    persist_userdata(&ctx, decoded.as_ref().ok()).await?;

    let mut outcome = InitOutcome {
        datasource: ctx.datasource_name().to_string(),
        instance_id: ctx.instance_id().to_string(),
        new_instance,
        ..InitOutcome::default()
    };

    outcome.dispatch = skip_if_recoverable(consume_user_data(&ctx, decoded).await)?;
    if let Some(report) = &outcome.dispatch {
        for failure in &report.failures {
            warn!(
                "Handler {} failed on {} ({}): {}",
                failure.handler,
                failure.filename.as_deref().unwrap_or("-"),
                failure.hook,
                failure.message
            );
        }
    }

    if ctx.config().run_user_scripts {
        let dir = ctx.paths().user_scripts_dir();
        let result = ctx
            .run_gated(USER_SCRIPTS, Frequency::OncePerInstance, false, move || async move {
                scripts::run_user_scripts(&dir).await
            })
            .await;
        outcome.scripts = skip_if_recoverable(result)?;
    }

    info!("Init stage: completed");
    Ok(outcome)
}

/// Dispatch the decoded payload with the built-in handlers
async fn consume_user_data(
    ctx: &InitContext,
    decoded: Result<Node, InitError>,
) -> Result<Option<DispatchReport>, InitError> {
    let mut handlers = HandlerRegistry::builtin();
    let mut handler_ctx = ctx.handler_context();

    ctx.run_gated(CONSUME_USER_DATA, Frequency::OncePerInstance, false, move || async move {
        let root = decoded?;
        Ok(userdata::dispatch(&root, &mut handlers, &mut handler_ctx).await)
    })
    .await
}

/// Write user-data.txt, and user-data.txt.i when the payload decoded
async fn persist_userdata(ctx: &InitContext, decoded: Option<&Node>) -> Result<(), InitError> {
    let raw = ctx.raw_user_data();
    match decoded {
        Some(root) => {
            let serialized = userdata::create_multipart(root);
            ctx.state().save_userdata(raw, serialized.as_bytes()).await
        }
        None => {
            warn!("User-data could not be decoded, saving raw payload only");
            crate::state::write_file(&ctx.paths().user_data_raw(), raw, 0o600).await
        }
    }
}

/// A recoverable failure, such as a held lock, skips the action for this boot
fn skip_if_recoverable<T>(result: Result<Option<T>, InitError>) -> Result<Option<T>, InitError> {
    match result {
        Err(e) if !e.is_fatal() => {
            warn!("Skipping action: {}", e);
            Ok(None)
        }
        other => other,
    }
}
