use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use veil_crypto::{
    persistence, pickle, Account, CryptoConfig, CryptoContext, Engine, InboundGroupSession,
    OutboundGroupSession, PublishedKeyDirectory, Session,
};

#[derive(Parser)]
#[command(name = "veil", about = "Veil end-to-end encryption toolkit")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select a backend and run a pairwise and a group round trip on it
    Selftest {
        /// Skip the native engine
        #[arg(long)]
        fallback: bool,
    },
    /// Create or reopen the identity of a device
    Init {
        #[arg(long)]
        user: String,
        #[arg(long)]
        device: String,
        /// Directory for device records, overrides config
        #[arg(long)]
        store_dir: Option<PathBuf>,
        /// Store secret, overrides config
        #[arg(long)]
        secret: Option<String>,
        /// One-time keys to generate
        #[arg(long)]
        keys: Option<usize>,
    },
    /// Delete the persisted identity of a user
    Reset {
        #[arg(long)]
        user: String,
        /// Directory for device records, overrides config
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
    /// Print the cleartext header of a pickle or device record
    Inspect { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veil_crypto=info,veil=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        CryptoConfig::from_file(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?
    } else {
        CryptoConfig::default()
    };
    config
        .apply_env_overrides()
        .context("invalid VEIL_* environment override")?;

    match args.command {
        Command::Selftest { fallback } => {
            config.force_fallback |= fallback;
            selftest(config).await
        }
        Command::Init {
            user,
            device,
            store_dir,
            secret,
            keys,
        } => {
            if let Some(dir) = store_dir {
                config.store_dir = Some(dir);
            }
            if let Some(keys) = keys {
                config.initial_one_time_keys = keys;
            }
            init(config, &user, &device, secret.as_deref(), keys).await
        }
        Command::Reset { user, store_dir } => {
            if let Some(dir) = store_dir {
                config.store_dir = Some(dir);
            }
            reset(config, &user)
        }
        Command::Inspect { file } => inspect(&file),
    }
}

async fn selftest(config: CryptoConfig) -> Result<()> {
    let context = CryptoContext::in_memory(config);
    let engine = context
        .initialize()
        .await
        .context("no usable crypto backend")?;

    pairwise_round_trip(&engine).context("pairwise round trip failed")?;
    group_round_trip(&engine).context("group round trip failed")?;

    info!(backend = %engine.kind(), "self-test passed");
    println!(
        "{}",
        json!({ "backend": engine.kind().to_string(), "native": context.is_native_active() })
    );
    Ok(())
}

fn pairwise_round_trip(engine: &Engine) -> Result<()> {
    let alice = Account::new(engine)?;
    let bob = Account::new(engine)?;

    alice.generate_one_time_keys(5)?;
    let directory = PublishedKeyDirectory::new(alice.identity_keys());
    directory.publish(&alice);
    // Bob takes the third published key.
    directory.claim()?;
    directory.claim()?;
    let claimed = directory.claim()?;

    let bob_session = Session::create_outbound(
        &bob,
        &claimed.identity_keys.curve25519,
        &claimed.one_time_key.public_key,
    )?;
    let hello = bob_session.encrypt(b"hello")?;
    ensure!(hello.is_prekey(), "first message was not a pre-key message");

    let (alice_session, plaintext) =
        Session::create_inbound(&alice, &bob.identity_keys().curve25519, &hello)?;
    ensure!(plaintext == b"hello", "inbound session decrypted the wrong plaintext");

    let hi = alice_session.encrypt(b"hi")?;
    ensure!(!hi.is_prekey(), "reply was not a normal message");
    ensure!(bob_session.decrypt(&hi)? == b"hi", "reply decrypted to the wrong plaintext");
    Ok(())
}

fn group_round_trip(engine: &Engine) -> Result<()> {
    let outbound = OutboundGroupSession::new(engine)?;
    let inbound = InboundGroupSession::import(engine, &outbound.export_session_key()?)?;

    for (expected, text) in ["one", "two", "three"].into_iter().enumerate() {
        let message = outbound.encrypt(text.as_bytes())?;
        let decrypted = inbound.decrypt(&message)?;
        ensure!(decrypted.plaintext == text.as_bytes(), "group plaintext mismatch");
        ensure!(
            decrypted.message_index as usize == expected,
            "group message index {} != {expected}",
            decrypted.message_index
        );
    }
    Ok(())
}

async fn init(
    config: CryptoConfig,
    user: &str,
    device: &str,
    secret: Option<&str>,
    extra_keys: Option<usize>,
) -> Result<()> {
    if config.store_dir.is_none() {
        warn!("no store directory configured, identity will not outlive this process");
    }
    let context = CryptoContext::new(config).context("failed to open identity store")?;
    let init = context
        .initialize_identity(user, device, None, secret)
        .await
        .context("identity initialization failed")?;

    let Some(identity) = init.identity else {
        let persisted = init.conflicting_device_id.unwrap_or_default();
        println!(
            "{}",
            json!({ "has_mismatch": true, "conflicting_device_id": persisted })
        );
        bail!("store is bound to device {persisted}; run `veil reset --user {user}` to re-register");
    };

    if !identity.created {
        if let Some(count) = extra_keys {
            identity.account.generate_one_time_keys(count)?;
        }
    }
    let directory = PublishedKeyDirectory::new(identity.account.identity_keys());
    let published = directory.publish(&identity.account);
    context
        .persist_identity(&identity, secret)
        .context("failed to persist identity")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "user_id": identity.device.user_id,
            "device_id": identity.device.device_id,
            "store_name": identity.store_name,
            "backend": identity.account.backend().to_string(),
            "created": identity.created,
            "identity_keys": identity.account.identity_keys(),
            "published_one_time_keys": published,
        }))?
    );
    Ok(())
}

fn reset(config: CryptoConfig, user: &str) -> Result<()> {
    let context = CryptoContext::new(config).context("failed to open identity store")?;
    let existed = context.clear_persisted_identity(user)?;
    println!("{}", json!({ "user_id": user, "removed": existed }));
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let data =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    let value = if pickle::has_valid_header(&data) {
        let header = pickle::read_header(&data)?;
        json!({ "format": "pickle", "header": header })
    } else if persistence::has_valid_header(&data) {
        let header = persistence::read_record_header(&data)?;
        json!({ "format": "device record", "header": header })
    } else {
        bail!("{} is neither a pickle nor a device record", path.display());
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
