//! headcni - the CNI plugin binary
//!
//! One-shot process invoked by the container runtime. Reads the command
//! from `CNI_COMMAND`, the network config from stdin, writes the result
//! JSON to stdout and errors as CNI error JSON to stderr.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use headcni::cni::{
    cmd_add, cmd_check, cmd_del, version_reply, CniEnv, CniError, ADD_TIMEOUT, DEL_TIMEOUT,
    ERR_INTERNAL, ERR_INVALID_NETWORK_CONFIG, ERR_TRY_AGAIN_LATER,
};
use headcni::config::{NetConf, DEFAULT_STATE_DIR};
use headcni::ipam::{IpamError, PoolError};

#[tokio::main]
async fn main() {
    // Stdout belongs to the CNI result; everything else goes to stderr.
    init_tracing();

    let env = match CniEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            emit_error("", ERR_INVALID_NETWORK_CONFIG, &e);
            std::process::exit(1);
        }
    };

    let mut stdin = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut stdin) {
        emit_error("", ERR_INTERNAL, &anyhow::anyhow!("failed to read stdin: {}", e));
        std::process::exit(1);
    }

    // VERSION may arrive with an empty or minimal config.
    if env.command == "VERSION" {
        let version = serde_json::from_slice::<serde_json::Value>(&stdin)
            .ok()
            .and_then(|v| v.get("cniVersion").and_then(|s| s.as_str()).map(String::from))
            .unwrap_or_default();
        println!("{}", version_reply(&version));
        return;
    }

    let conf = match NetConf::parse(&stdin) {
        Ok(conf) => conf,
        Err(e) => {
            emit_error("", ERR_INVALID_NETWORK_CONFIG, &e);
            std::process::exit(1);
        }
    };

    match run(&conf, &env).await {
        Ok(()) => {}
        Err(e) => {
            emit_error(&conf.cni_version, classify(&e), &e);
            std::process::exit(1);
        }
    }
}

async fn run(conf: &NetConf, env: &CniEnv) -> Result<()> {
    let ipam_root = ipam_root();

    match env.command.as_str() {
        "ADD" => {
            let result = tokio::time::timeout(ADD_TIMEOUT, cmd_add(conf, env, &ipam_root))
                .await
                .context("ADD timed out")??;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        "DEL" => {
            tokio::time::timeout(DEL_TIMEOUT, cmd_del(conf, env, &ipam_root))
                .await
                .context("DEL timed out")??;
            Ok(())
        }
        "CHECK" => cmd_check(conf, env).await,
        other => anyhow::bail!("unsupported CNI_COMMAND {:?}", other),
    }
}

fn ipam_root() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR).join("ipam")
}

/// Map an error chain onto a CNI error code.
fn classify(e: &anyhow::Error) -> u32 {
    for cause in e.chain() {
        if let Some(ipam) = cause.downcast_ref::<IpamError>() {
            return match ipam {
                IpamError::Pool(PoolError::Exhausted { .. }) => ERR_TRY_AGAIN_LATER,
                _ => ERR_INTERNAL,
            };
        }
        if cause.downcast_ref::<PoolError>().is_some() {
            return ERR_TRY_AGAIN_LATER;
        }
    }
    let text = e.to_string();
    if text.contains("invalid") || text.contains("missing") || text.contains("no pod CIDR") {
        ERR_INVALID_NETWORK_CONFIG
    } else {
        ERR_INTERNAL
    }
}

fn emit_error(cni_version: &str, code: u32, e: &anyhow::Error) {
    tracing::error!("{:#}", e);
    let error = CniError::new(cni_version, code, &e.to_string(), Some(format!("{:#}", e)));
    if let Ok(body) = serde_json::to_string(&error) {
        eprintln!("{}", body);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("HEADCNI_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
