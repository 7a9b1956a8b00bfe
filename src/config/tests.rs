use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tempfile::tempdir;

use super::types::DurationValue;
use super::{ControllerSettings, load_config_file, parse_duration_value};
use crate::args::{ControllerArgs, Role};
use crate::error::{AppError, AppResult, ConfigError};
use crate::scheduler::SchedulerKind;

fn args(extra: &[&str]) -> AppResult<ControllerArgs> {
    let mut argv = vec!["loadplane"];
    argv.extend_from_slice(extra);
    Ok(ControllerArgs::try_parse_from(argv)?)
}

fn write_config(name: &str, content: &str) -> AppResult<(tempfile::TempDir, PathBuf)> {
    let dir = tempdir()?;
    let path = dir.path().join(name);
    std::fs::write(&path, content)?;
    Ok((dir, path))
}

#[test]
fn toml_config_fills_every_section() -> AppResult<()> {
    let (_dir, path) = write_config(
        "loadplane.toml",
        r#"
context = "staging"

[scheduler]
kind = "gateway"
gateway = "http://gateway.internal:8080/"
gc_duration = "30m"
on_demand = true
max_engines_in_collection = 40

[engine]
kind = "jmeter"
image = "registry.local/jmeter:5.6"
cpu = "2"
mem = "2Gi"
request_timeout = 10

[retry]
attempts = 3
interval = "500ms"

[reconcile]
check_interval = "1s"
check_workers = 6
purge_interval = "2m"

[ingress]
lifespan = "1h"
gc_interval = 45

[store]
path = "/var/lib/loadplane/state.db"

[artifacts]
root = "/srv/artifacts"

[metrics]
listen = "127.0.0.1:9100"
"#,
    )?;
    let settings = ControllerSettings::from_config(Some(load_config_file(&path)?), &args(&[])?)?;

    if settings.context != "staging" || settings.role != Role::All {
        return Err(AppError::config(format!("unexpected identity {:?}", settings)));
    }
    if settings.scheduler
        != (SchedulerKind::Gateway {
            base_url: "http://gateway.internal:8080".to_owned(),
        })
    {
        return Err(AppError::config("gateway url should be normalized"));
    }
    if settings.max_engines_in_collection != 40
        || settings.container.image != "registry.local/jmeter:5.6"
        || settings.container.mem != "2Gi"
        || settings.request_timeout != Duration::from_secs(10)
    {
        return Err(AppError::config(format!("unexpected engine settings {:?}", settings)));
    }
    if settings.retry.attempts != 3 || settings.retry.interval != Duration::from_millis(500) {
        return Err(AppError::config("unexpected retry settings"));
    }
    let reconcile = settings.reconcile;
    if reconcile.check_interval != Duration::from_secs(1)
        || reconcile.check_workers != 6
        || reconcile.purge_interval != Duration::from_secs(120)
        || reconcile.cache_prune_interval != Duration::from_secs(120)
        || reconcile.gc_duration != Duration::from_secs(1800)
        || !reconcile.on_demand
        || reconcile.ingress_lifespan != Duration::from_secs(3600)
        || reconcile.ingress_gc_interval != Duration::from_secs(45)
    {
        return Err(AppError::config(format!("unexpected reconcile {:?}", reconcile)));
    }
    if settings.store_path != Some(PathBuf::from("/var/lib/loadplane/state.db"))
        || settings.artifacts_root != PathBuf::from("/srv/artifacts")
        || settings.metrics_listen != "127.0.0.1:9100".parse::<SocketAddr>().ok()
    {
        return Err(AppError::config("unexpected storage settings"));
    }
    Ok(())
}

#[test]
fn json_config_and_cli_overrides() -> AppResult<()> {
    let (_dir, path) = write_config(
        "loadplane.json",
        r#"{
            "context": "prod",
            "distributed_mode": true,
            "scheduler": { "gateway": "https://workers.example.com" }
        }"#,
    )?;
    let config = load_config_file(&path)?;
    let settings = ControllerSettings::from_config(Some(config), &args(&[])?)?;
    if settings.role != Role::Api || settings.context != "prod" {
        return Err(AppError::config("distributed mode defaults to the api role"));
    }

    let config = load_config_file(&path)?;
    let settings = ControllerSettings::from_config(
        Some(config),
        &args(&["--role", "reconciler", "--context", "canary"])?,
    )?;
    if settings.role != Role::Reconciler || settings.context != "canary" {
        return Err(AppError::config("cli flags override the config file"));
    }
    Ok(())
}

#[test]
fn defaults_apply_without_optional_sections() -> AppResult<()> {
    let (_dir, path) = write_config(
        "loadplane.toml",
        "[scheduler]\ngateway = \"http://127.0.0.1:8080\"\n",
    )?;
    let settings = ControllerSettings::from_config(Some(load_config_file(&path)?), &args(&[])?)?;
    if settings.context != "local"
        || settings.max_engines_in_collection != 500
        || settings.retry.attempts != 5
        || settings.retry.interval != Duration::from_secs(10)
        || settings.reconcile.check_workers != 3
        || settings.reconcile.gc_duration != Duration::from_secs(900)
        || settings.reconcile.ingress_lifespan != Duration::from_secs(1800)
        || settings.reconcile.ingress_gc_interval != Duration::from_secs(30)
        || settings.store_path.is_some()
        || settings.metrics_listen.is_some()
    {
        return Err(AppError::config(format!("unexpected defaults {:?}", settings)));
    }
    Ok(())
}

#[test]
fn invalid_settings_are_rejected() -> AppResult<()> {
    let cases = [
        ("[scheduler]\nkind = \"k8s\"\ngateway = \"http://g\"\n", "unknown scheduler"),
        ("[scheduler]\nkind = \"gateway\"\n", "missing gateway"),
        ("[scheduler]\ngateway = \"not a url\"\n", "bad gateway"),
        ("[scheduler]\ngateway = \"http://g\"\n[engine]\nkind = \"locust\"\n", "unknown engine"),
        ("[scheduler]\ngateway = \"http://g\"\n[reconcile]\ncheck_workers = 0\n", "zero workers"),
        ("[scheduler]\ngateway = \"http://g\"\n[retry]\ninterval = \"5d\"\n", "bad unit"),
        ("[scheduler]\ngateway = \"http://g\"\n[metrics]\nlisten = \"localhost\"\n", "bad listen"),
    ];
    for (content, name) in cases {
        let (_dir, path) = write_config("loadplane.toml", content)?;
        let config = load_config_file(&path)?;
        let result = ControllerSettings::from_config(Some(config), &args(&[])?);
        let expected = match (&result, name) {
            (Err(AppError::Config(ConfigError::UnsupportedSchedulerKind { .. })), "unknown scheduler")
            | (Err(AppError::Config(ConfigError::MissingGateway)), "missing gateway")
            | (Err(AppError::Config(ConfigError::InvalidGatewayUrl { .. })), "bad gateway")
            | (Err(AppError::Config(ConfigError::UnsupportedEngineKind { .. })), "unknown engine")
            | (Err(AppError::Config(ConfigError::FieldMustBePositive { .. })), "zero workers")
            | (Err(AppError::Config(ConfigError::InvalidDuration { .. })), "bad unit")
            | (Err(AppError::Config(ConfigError::InvalidListenAddr { .. })), "bad listen") => true,
            _ => false,
        };
        if !expected {
            return Err(AppError::config(format!("{}: unexpected {:?}", name, result)));
        }
    }
    Ok(())
}

#[test]
fn unsupported_extension_is_rejected() -> AppResult<()> {
    let (_dir, path) = write_config("loadplane.yaml", "context: x\n")?;
    match load_config_file(&path) {
        Err(AppError::Config(ConfigError::UnsupportedExtension { ext })) if ext == "yaml" => Ok(()),
        other => Err(AppError::config(format!("unexpected {:?}", other))),
    }
}

#[test]
fn durations_accept_units_and_plain_seconds() -> AppResult<()> {
    let cases = [
        ("250ms", Duration::from_millis(250)),
        ("15", Duration::from_secs(15)),
        ("2s", Duration::from_secs(2)),
        ("15m", Duration::from_secs(900)),
        ("1h", Duration::from_secs(3600)),
    ];
    for (text, expected) in cases {
        let parsed = parse_duration_value(text).map_err(AppError::config)?;
        if parsed != expected {
            return Err(AppError::config(format!("{} parsed as {:?}", text, parsed)));
        }
    }
    for bad in ["", "0s", "ms", "10w", "-5s"] {
        if parse_duration_value(bad).is_ok() {
            return Err(AppError::config(format!("{:?} should be rejected", bad)));
        }
    }
    if DurationValue::Seconds(0).to_duration().is_ok() {
        return Err(AppError::config("zero seconds should be rejected"));
    }
    Ok(())
}
