//! Command-line front end for computing, anchoring and verifying report
//! digests.
//!
//! `digest`, `address` and `demo` run entirely offline.  The ledger commands
//! need the `net` feature and read their connection settings from the
//! environment (`RPC_URL`, `CONTRACT_ADDRESS`, `PRIVATE_KEY` or
//! `PRIVATE_KEY_FILE`, ...) or from `--config <file.json>`.

use evidence_anchor::{
    AnchorClient, AnchorSettings, CanonicalReport, DigestVersion, InMemoryLedger, KeySource,
    LedgerBackend, MemoryReportStore, NewReport, ReportDesk, ReportStatus, Sha256ContentIds,
    SigningCredential, VerificationResult, Verifier,
};
#[cfg(feature = "net")]
use evidence_anchor::{AnchorConfig, EvmLedger};
#[cfg(feature = "net")]
use std::path::Path;
use std::{env, process, sync::Arc, time::Duration};
use tokio::runtime::{Builder, Runtime};
use tracing_subscriber::EnvFilter;

const RUNTIME_SHUTDOWN_MS: u64 = 1_000;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    process::exit(1);
}

fn print_help() {
    println!("Usage: anchorctl <command> ...");
    println!("  digest <id> <description> <location> <category> <cid> [--legacy]");
    println!("  address [--key <hex|env:NAME|file>]");
    println!("  demo");
    if cfg!(feature = "net") {
        println!("  anchor <id> <description> <location> <category> <cid> [--config <file>]");
        println!("  verify <id> <description> <location> <category> <cid> [--legacy] [--config <file>]");
        println!("  record <id> [--config <file>]");
        println!("  status <id> <status> [--config <file>]");
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn runtime() -> Runtime {
    Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")))
}

fn main() {
    init_logging();
    let mut args = env::args().skip(1);
    let command = args.next();
    let tail: Vec<String> = args.collect();
    match command.as_deref() {
        Some("digest") => cmd_digest(tail),
        Some("address") => cmd_address(tail),
        Some("demo") => cmd_demo(),
        #[cfg(feature = "net")]
        Some("anchor") => cmd_anchor(tail),
        #[cfg(feature = "net")]
        Some("verify") => cmd_verify(tail),
        #[cfg(feature = "net")]
        Some("record") => cmd_record(tail),
        #[cfg(feature = "net")]
        Some("status") => cmd_status(tail),
        Some("-h") | Some("--help") | None => print_help(),
        Some(other) => {
            eprintln!("unknown command: {other}");
            print_help();
            process::exit(1);
        }
    }
}

struct Parsed {
    positional: Vec<String>,
    legacy: bool,
    key: Option<String>,
    config: Option<String>,
}

fn parse_args(args: Vec<String>) -> Parsed {
    let mut parsed = Parsed {
        positional: Vec::new(),
        legacy: false,
        key: None,
        config: None,
    };
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--legacy" => parsed.legacy = true,
            "--key" => {
                parsed.key = Some(iter.next().unwrap_or_else(|| fatal("--key needs a value")))
            }
            "--config" => {
                parsed.config =
                    Some(iter.next().unwrap_or_else(|| fatal("--config needs a value")))
            }
            other if other.starts_with("--") => fatal(&format!("unknown argument: {other}")),
            _ => parsed.positional.push(arg),
        }
    }
    parsed
}

fn report_from(positional: &[String]) -> CanonicalReport {
    match positional {
        [id, description, location, category, cid] => {
            CanonicalReport::new(id, description, location, category, cid)
        }
        _ => fatal("expected <id> <description> <location> <category> <cid>"),
    }
}

fn version_for(legacy: bool) -> DigestVersion {
    if legacy {
        DigestVersion::LegacyConcat
    } else {
        DigestVersion::V1
    }
}

fn cmd_digest(args: Vec<String>) {
    let parsed = parse_args(args);
    let report = report_from(&parsed.positional);
    match report.digest_with(version_for(parsed.legacy)) {
        Ok(digest) => println!("{digest}"),
        Err(err) => fatal(&err.to_string()),
    }
}

fn cmd_address(args: Vec<String>) {
    let parsed = parse_args(args);
    let source = KeySource::from_spec(parsed.key.as_deref());
    match SigningCredential::load(&source) {
        Ok(credential) => println!("{}", credential.address()),
        Err(err) => fatal(&format!("failed to load key: {err}")),
    }
}

fn cmd_demo() {
    let rt = runtime();
    let outcome = rt.block_on(run_demo());
    rt.shutdown_timeout(Duration::from_millis(RUNTIME_SHUTDOWN_MS));
    if let Err(message) = outcome {
        fatal(&message);
    }
}

fn expect_result(
    label: &str,
    got: VerificationResult,
    want: VerificationResult,
) -> Result<(), String> {
    println!("{label}: {got}");
    if got == want {
        Ok(())
    } else {
        Err(format!("{label}: expected {want}, got {got}"))
    }
}

async fn run_demo() -> Result<(), String> {
    let admin = Arc::new(SigningCredential::random());
    let reporter = Arc::new(SigningCredential::random());
    let ledger = Arc::new(InMemoryLedger::new(admin.address()));
    let settings = AnchorSettings {
        confirm_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
    };
    let client = Arc::new(AnchorClient::new(ledger.clone(), reporter, settings));
    let operator = AnchorClient::new(ledger.clone(), admin, settings);
    let verifier = Verifier::new(ledger.clone());

    println!("scenario A: anchor then verify");
    let report = CanonicalReport::new("RPT1", "Bike stolen", "5th Ave", "Theft", "Qm123");
    let digest = report.digest().map_err(|err| err.to_string())?;
    let proof = client
        .anchor("RPT1", digest)
        .await
        .map_err(|err| err.to_string())?;
    println!("  digest {digest} anchored in block {} ({})", proof.block_number, proof.tx_hash);
    let verdict = verifier.verify(&report).map_err(|err| err.to_string())?;
    expect_result("  verify", verdict, VerificationResult::Match)?;

    println!("scenario B: altered location");
    let altered = CanonicalReport::new("RPT1", "Bike stolen", "6th Ave", "Theft", "Qm123");
    let verdict = verifier.verify(&altered).map_err(|err| err.to_string())?;
    expect_result("  verify", verdict, VerificationResult::Mismatch)?;

    println!("scenario C: ledger down at submission, reconciled later");
    let desk = ReportDesk::new(
        Arc::new(MemoryReportStore::new()),
        Arc::new(Sha256ContentIds),
        client.clone(),
    );
    ledger.set_reachable(false);
    let (record, handle) = desk
        .submit(
            NewReport {
                description: "Broken streetlight".into(),
                location: "Main St".into(),
                category: "Infrastructure".into(),
            },
            b"evidence photo",
        )
        .await
        .map_err(|err| err.to_string())?;
    let failure = match handle.await {
        Ok(Err(failure)) => failure.to_string(),
        Ok(Ok(_)) => return Err("anchoring succeeded against an unreachable ledger".into()),
        Err(err) => return Err(err.to_string()),
    };
    println!("  record {} stored, anchoring failed: {failure}", record.report_id());
    ledger.set_reachable(true);
    let verdict = verifier.verify(&record.report).map_err(|err| err.to_string())?;
    expect_result("  verify before retry", verdict, VerificationResult::NotAnchored)?;
    let summary = desk.reconcile_pass().await.map_err(|err| err.to_string())?;
    println!("  reconcile: {summary:?}");
    let verdict = verifier.verify(&record.report).map_err(|err| err.to_string())?;
    expect_result("  verify after retry", verdict, VerificationResult::Match)?;

    println!("scenario D: status updates are admin-only");
    match client.push_status("RPT1", &ReportStatus::Resolved).await {
        Err(err) => println!("  reporter rejected: {err}"),
        Ok(_) => return Err("non-admin status update was accepted".into()),
    }
    operator
        .push_status("RPT1", &ReportStatus::Resolved)
        .await
        .map_err(|err| err.to_string())?;
    let record = ledger.get_report("RPT1").map_err(|err| err.to_string())?;
    println!("  status on ledger: {}", record.status);
    let events = ledger.events().map_err(|err| err.to_string())?;
    println!("  ledger events: {}", events.len());
    Ok(())
}

#[cfg(feature = "net")]
fn load_config(parsed: &Parsed) -> AnchorConfig {
    let loaded = match &parsed.config {
        Some(path) => AnchorConfig::from_json_file(Path::new(path)),
        None => AnchorConfig::from_env(),
    };
    loaded.unwrap_or_else(|err| fatal(&format!("configuration error: {err}")))
}

#[cfg(feature = "net")]
fn connect(cfg: &AnchorConfig) -> Arc<EvmLedger> {
    Arc::new(EvmLedger::new(cfg).unwrap_or_else(|err| fatal(&err.to_string())))
}

#[cfg(feature = "net")]
fn signing_client(cfg: &AnchorConfig, ledger: Arc<EvmLedger>) -> AnchorClient {
    let credential = SigningCredential::load(&cfg.key)
        .unwrap_or_else(|err| fatal(&format!("failed to load key: {err}")));
    AnchorClient::new(ledger, Arc::new(credential), cfg.settings)
}

#[cfg(feature = "net")]
fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => fatal(&format!("failed to encode output: {err}")),
    }
}

#[cfg(feature = "net")]
fn cmd_anchor(args: Vec<String>) {
    let parsed = parse_args(args);
    let report = report_from(&parsed.positional);
    let digest = report
        .digest()
        .unwrap_or_else(|err| fatal(&err.to_string()));
    let cfg = load_config(&parsed);
    let client = signing_client(&cfg, connect(&cfg));
    let rt = runtime();
    let outcome = rt.block_on(client.anchor(&report.report_id, digest));
    rt.shutdown_timeout(Duration::from_millis(RUNTIME_SHUTDOWN_MS));
    match outcome {
        Ok(proof) => print_json(&proof),
        Err(failure) => {
            if let Some(tx) = failure.pending_tx() {
                eprintln!("pending transaction: {tx}");
            }
            fatal(&format!("anchoring failed: {failure}"));
        }
    }
}

#[cfg(feature = "net")]
fn cmd_verify(args: Vec<String>) {
    let parsed = parse_args(args);
    let report = report_from(&parsed.positional);
    let cfg = load_config(&parsed);
    let verifier = Verifier::new(connect(&cfg));
    match verifier.verify_with(&report, version_for(parsed.legacy)) {
        Ok(result) => {
            println!("{result}");
            if result != VerificationResult::Match {
                process::exit(2);
            }
        }
        Err(err) => fatal(&err.to_string()),
    }
}

#[cfg(feature = "net")]
fn cmd_record(args: Vec<String>) {
    let parsed = parse_args(args);
    let [report_id] = parsed.positional.as_slice() else {
        fatal("expected <id>");
    };
    let cfg = load_config(&parsed);
    match connect(&cfg).get_report(report_id) {
        Ok(record) => print_json(&record),
        Err(err) => fatal(&err.to_string()),
    }
}

#[cfg(feature = "net")]
fn cmd_status(args: Vec<String>) {
    let parsed = parse_args(args);
    let [report_id, status] = parsed.positional.as_slice() else {
        fatal("expected <id> <status>");
    };
    let status: ReportStatus = status
        .parse()
        .unwrap_or_else(|err: evidence_anchor::status::EmptyStatus| fatal(&err.to_string()));
    let cfg = load_config(&parsed);
    let client = signing_client(&cfg, connect(&cfg));
    let rt = runtime();
    let outcome = rt.block_on(client.push_status(report_id, &status));
    rt.shutdown_timeout(Duration::from_millis(RUNTIME_SHUTDOWN_MS));
    match outcome {
        Ok(proof) => print_json(&proof),
        Err(failure) => fatal(&format!("status update failed: {failure}")),
    }
}
