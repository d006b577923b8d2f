//! Values restructuring for the 0.8 layout.
//!
//! Pure functions over a [`ValuesTree`]: the external database block is
//! folded into `promscale.connection`, and the `promscale` block is rewritten
//! to the key names the 0.8 chart expects. Every function is safe to run on
//! an already migrated tree.

use serde_yaml::{Mapping, Value};

use crate::error::TobsError;
use crate::values::{ValuesTree, expect_bool, expect_mapping, expect_mapping_mut, expect_str, expect_string_list};

/// Image pinned by 0.7 charts when tracing was enabled.
pub const DEPRECATED_IMAGE: &str = "timescale/promscale:0.7.0-beta.latest";

/// Promscale flag that no longer exists.
pub const REMOVED_ARG: &str = "-otlp-grpc-server-listen-address=:9202";

/// Promscale flag that was renamed.
pub const RENAMED_ARG: (&str, &str) = ("--high-availability", "--metrics.high-availability");

const EXTERNAL_DB: &str = "timescaledbExternal";
const PROMSCALE: &str = "promscale";

/// Result of restructuring the `promscale` block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Restructured {
    /// The deprecated `promscale.tracing` block was present and enabled.
    pub tracing_enabled: bool,
    /// `promscale` was absent and has been synthesized.
    pub synthesized: bool,
}

/// Remove `timescaledbExternal`, returning its URI when it was enabled.
pub fn extract_external_db(values: &mut ValuesTree) -> Result<Option<String>, TobsError> {
    let Some(external) = values.get(EXTERNAL_DB) else {
        return Ok(None);
    };

    let uri = match external {
        Value::Null => None,
        other => {
            let external = expect_mapping(EXTERNAL_DB, other)?;
            let enabled = expect_bool(
                "timescaledbExternal.enabled",
                external.get("enabled").unwrap_or(&Value::Null),
            )?;
            if enabled {
                let uri = expect_str(
                    "timescaledbExternal.db_uri",
                    external.get("db_uri").unwrap_or(&Value::Null),
                )?;
                Some(uri.to_string())
            } else {
                None
            }
        }
    };

    values.root_mut().shift_remove(EXTERNAL_DB);
    Ok(uri)
}

/// Rewrite promscale arguments: drop every [`REMOVED_ARG`] and rename every
/// exact [`RENAMED_ARG`] in place. Other entries keep their relative order.
pub fn rewrite_args(args: Vec<String>) -> Vec<String> {
    let (old, new) = RENAMED_ARG;
    args.into_iter()
        .filter(|arg| arg != REMOVED_ARG)
        .map(|arg| if arg == old { new.to_string() } else { arg })
        .collect()
}

/// Whether a `loadBalancer.enabled` value turns the load balancer on.
fn load_balancer_enabled(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(enabled)) => *enabled,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

fn connection_values(uri: Option<&str>, credential: Option<&str>) -> Mapping {
    let mut connection = Mapping::new();
    connection.insert("uri".into(), uri.unwrap_or_default().into());
    connection.insert("password".into(), credential.unwrap_or_default().into());
    connection
}

/// Restructure the `promscale` block in place.
///
/// `external_uri` comes from [`extract_external_db`]; `credential` is the
/// database superuser password captured before migration.
pub fn restructure(
    values: &mut ValuesTree,
    external_uri: Option<&str>,
    credential: Option<&str>,
) -> Result<Restructured, TobsError> {
    let Some(node) = values.root_mut().get_mut(PROMSCALE) else {
        let mut promscale = Mapping::new();
        promscale.insert(
            "connection".into(),
            Value::Mapping(connection_values(external_uri, credential)),
        );
        values
            .root_mut()
            .insert(PROMSCALE.into(), Value::Mapping(promscale));
        return Ok(Restructured {
            tracing_enabled: false,
            synthesized: true,
        });
    };

    let promscale = expect_mapping_mut(PROMSCALE, node)?;
    let tracing_enabled = rename_tracing(promscale)?;
    drop_deprecated_image(promscale)?;

    if let Some(args) = promscale.get_mut("args") {
        let rewritten = rewrite_args(expect_string_list("promscale.args", args)?);
        *args = Value::Sequence(rewritten.into_iter().map(Value::from).collect());
    }

    if let Some(connection) = promscale.get_mut("connection") {
        let connection = expect_mapping_mut("promscale.connection", connection)?;
        rewrite_connection(connection, external_uri, credential)?;
    }

    if let Some(service) = promscale.get_mut("service") {
        let service = expect_mapping_mut("promscale.service", service)?;
        flatten_service_type(service)?;
    }

    Ok(Restructured {
        tracing_enabled,
        synthesized: false,
    })
}

/// `promscale.tracing` becomes `promscale.openTelemetry`.
fn rename_tracing(promscale: &mut Mapping) -> Result<bool, TobsError> {
    let Some(tracing) = promscale.get("tracing") else {
        return Ok(false);
    };

    let block = expect_mapping("promscale.tracing", tracing)?;
    let enabled = expect_bool(
        "promscale.tracing.enabled",
        block.get("enabled").unwrap_or(&Value::Null),
    )?;

    if let Some(tracing) = promscale.shift_remove("tracing") {
        promscale.insert("openTelemetry".into(), tracing);
    }
    Ok(enabled)
}

fn drop_deprecated_image(promscale: &mut Mapping) -> Result<(), TobsError> {
    let Some(image) = promscale.get("image") else {
        return Ok(());
    };
    if expect_str("promscale.image", image)? == DEPRECATED_IMAGE {
        promscale.shift_remove("image");
    }
    Ok(())
}

fn rewrite_connection(
    connection: &mut Mapping,
    external_uri: Option<&str>,
    credential: Option<&str>,
) -> Result<(), TobsError> {
    if let Some(uri) = external_uri {
        connection.insert("uri".into(), uri.into());
    }

    if let (Some(password), Some(credential)) = (connection.get_mut("password"), credential) {
        *password = credential.into();
    }

    if let Some(host) = connection.get_mut("host") {
        if !host.is_string() {
            let template = expect_mapping("promscale.connection.host", host)?;
            let resolved = expect_str(
                "promscale.connection.host.nameTemplate",
                template.get("nameTemplate").unwrap_or(&Value::Null),
            )?
            .to_string();
            *host = Value::from(resolved);
        }
    }
    Ok(())
}

fn flatten_service_type(service: &mut Mapping) -> Result<(), TobsError> {
    let Some(lb) = service.get("loadBalancer") else {
        return Ok(());
    };

    let lb = expect_mapping("promscale.service.loadBalancer", lb)?;
    let service_type = if load_balancer_enabled(lb.get("enabled")) {
        "LoadBalancer"
    } else {
        "ClusterIP"
    };

    service.insert("type".into(), service_type.into());
    service.shift_remove("loadBalancer");
    Ok(())
}
