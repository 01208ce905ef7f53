use evidence_anchor::{
    AnchorClient, AnchorFailure, AnchorSettings, AnchorState, CanonicalReport, InMemoryLedger,
    LedgerBackend, LedgerFault, LedgerRecord, MemoryReportStore, NewReport, ReconcileSummary,
    RegistryEvent, ReportDesk, ReportDigest, ReportStatus, Sha256ContentIds, SigningCredential,
    TxHash, TxReceipt, VerificationResult, Verifier,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Fixture {
    admin: Arc<SigningCredential>,
    reporter: Arc<SigningCredential>,
    ledger: Arc<InMemoryLedger>,
    verifier: Verifier,
}

fn settings(timeout_ms: u64) -> AnchorSettings {
    AnchorSettings {
        confirm_timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(5),
    }
}

fn fixture(ledger: impl FnOnce(&SigningCredential) -> InMemoryLedger) -> Fixture {
    let admin = Arc::new(SigningCredential::random());
    let reporter = Arc::new(SigningCredential::random());
    let ledger = Arc::new(ledger(&admin));
    let verifier = Verifier::new(ledger.clone());
    Fixture {
        admin,
        reporter,
        ledger,
        verifier,
    }
}

fn rpt1(location: &str) -> CanonicalReport {
    CanonicalReport::new("RPT1", "Bike stolen", location, "Theft", "Qm123")
}

#[tokio::test]
async fn scenario_a_anchor_then_match() {
    let fx = fixture(|admin| InMemoryLedger::new(admin.address()));
    let client = AnchorClient::new(fx.ledger.clone(), fx.reporter.clone(), settings(2_000));
    let digest = rpt1("5th Ave").digest().unwrap();
    let proof = client.anchor("RPT1", digest).await.unwrap();
    assert_eq!(proof.submitter, fx.reporter.address());
    assert_eq!(
        fx.verifier.verify(&rpt1("5th Ave")).unwrap(),
        VerificationResult::Match
    );
    assert_eq!(
        fx.ledger.events().unwrap(),
        vec![RegistryEvent::HashStored {
            report_id: "RPT1".into(),
            digest,
            submitter: fx.reporter.address(),
        }]
    );
}

#[tokio::test]
async fn scenario_b_altered_field_mismatches() {
    let fx = fixture(|admin| InMemoryLedger::new(admin.address()));
    let client = AnchorClient::new(fx.ledger.clone(), fx.reporter.clone(), settings(2_000));
    client
        .anchor("RPT1", rpt1("5th Ave").digest().unwrap())
        .await
        .unwrap();
    assert_eq!(
        fx.verifier.verify(&rpt1("6th Ave")).unwrap(),
        VerificationResult::Mismatch
    );
}

#[tokio::test]
async fn scenario_c_timeout_keeps_record_until_retry() {
    let fx = fixture(|admin| {
        InMemoryLedger::new(admin.address()).with_inclusion_delay(Duration::from_millis(200))
    });
    let client = Arc::new(AnchorClient::new(
        fx.ledger.clone(),
        fx.reporter.clone(),
        settings(40),
    ));
    let desk = ReportDesk::new(
        Arc::new(MemoryReportStore::new()),
        Arc::new(Sha256ContentIds),
        client,
    );

    let (record, handle) = desk
        .submit(
            NewReport {
                description: "Bike stolen".into(),
                location: "5th Ave".into(),
                category: "Theft".into(),
            },
            b"photo",
        )
        .await
        .unwrap();
    let failure = handle.await.unwrap().unwrap_err();
    assert!(matches!(failure, AnchorFailure::Timeout { pending_tx: Some(_) }));

    let stored = desk.store().get(record.report_id()).unwrap();
    assert!(stored.proof.is_none());
    assert_eq!(stored.anchor_state(), AnchorState::Pending);

    let before = fx.verifier.inspect(&record.report).unwrap();
    assert_eq!(before.computed, record.digest);
    assert_eq!(before.anchored, None);
    assert_eq!(before.result, VerificationResult::NotAnchored);
    assert_eq!(
        fx.verifier.verify(&record.report).unwrap(),
        VerificationResult::NotAnchored
    );
    assert_eq!(fx.ledger.block_number().unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let summary = desk.reconcile_pass().await.unwrap();
    assert_eq!(summary.anchored, 1);
    let stored = desk.store().get(record.report_id()).unwrap();
    assert_eq!(stored.proof.map(|p| p.tx_hash), failure.pending_tx());
    assert_eq!(
        fx.verifier.verify(&record.report).unwrap(),
        VerificationResult::Match
    );
    assert_eq!(fx.ledger.block_number().unwrap(), 1);
}

#[tokio::test]
async fn scenario_c_unanchored_record_reports_not_anchored() {
    let fx = fixture(|admin| InMemoryLedger::new(admin.address()));
    let client = Arc::new(AnchorClient::new(
        fx.ledger.clone(),
        fx.reporter.clone(),
        settings(2_000),
    ));
    let desk = ReportDesk::new(
        Arc::new(MemoryReportStore::new()),
        Arc::new(Sha256ContentIds),
        client,
    );
    fx.ledger.set_reachable(false);
    let (record, handle) = desk
        .submit(
            NewReport {
                description: "Graffiti".into(),
                location: "Station".into(),
                category: "Vandalism".into(),
            },
            b"photo",
        )
        .await
        .unwrap();
    assert!(handle.await.unwrap().is_err());
    fx.ledger.set_reachable(true);

    assert_eq!(
        fx.verifier.verify(&record.report).unwrap(),
        VerificationResult::NotAnchored
    );
    desk.reconcile_pass().await.unwrap();
    assert_eq!(
        fx.verifier.verify(&record.report).unwrap(),
        VerificationResult::Match
    );
}

#[tokio::test]
async fn scenario_d_only_admin_changes_status() {
    let fx = fixture(|admin| InMemoryLedger::new(admin.address()));
    let reporter = AnchorClient::new(fx.ledger.clone(), fx.reporter.clone(), settings(2_000));
    let operator = AnchorClient::new(fx.ledger.clone(), fx.admin.clone(), settings(2_000));
    reporter
        .anchor("RPT1", rpt1("5th Ave").digest().unwrap())
        .await
        .unwrap();

    operator
        .push_status("RPT1", &ReportStatus::Resolved)
        .await
        .unwrap();
    assert_eq!(
        fx.ledger.get_report("RPT1").unwrap().status,
        ReportStatus::Resolved
    );
    assert_eq!(
        fx.ledger.events().unwrap().last(),
        Some(&RegistryEvent::StatusUpdated {
            report_id: "RPT1".into(),
            status: ReportStatus::Resolved,
        })
    );

    let err = reporter
        .push_status("RPT1", &ReportStatus::UnderReview)
        .await
        .unwrap_err();
    assert_eq!(err, AnchorFailure::Unauthorized);
    assert_eq!(
        fx.ledger.get_report("RPT1").unwrap().status,
        ReportStatus::Resolved
    );
}

#[tokio::test]
async fn concurrent_stores_for_one_id_admit_exactly_one() {
    let fx = fixture(|admin| InMemoryLedger::new(admin.address()));
    let mut handles = Vec::new();
    for byte in 0..8u8 {
        let client = AnchorClient::new(
            fx.ledger.clone(),
            Arc::new(SigningCredential::random()),
            settings(2_000),
        );
        handles.push(tokio::spawn(async move {
            let digest = evidence_anchor::ReportDigest::from_bytes([byte; 32]);
            client.anchor("RPT1", digest).await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert_eq!(err, AnchorFailure::AlreadyStored),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(fx.ledger.block_number().unwrap(), 1);
}

/// Ledger whose store submissions block for a while before reaching the node.
struct SlowSubmits {
    inner: InMemoryLedger,
    delays_ms: Vec<u64>,
    submits: AtomicUsize,
}

impl SlowSubmits {
    fn new(admin: &SigningCredential, delays_ms: Vec<u64>) -> Self {
        Self {
            inner: InMemoryLedger::new(admin.address()),
            delays_ms,
            submits: AtomicUsize::new(0),
        }
    }
}

impl LedgerBackend for SlowSubmits {
    fn submit_store_digest(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        digest: &ReportDigest,
    ) -> Result<TxHash, LedgerFault> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(
            self.delays_ms.get(n).copied().unwrap_or(0),
        ));
        self.inner.submit_store_digest(credential, report_id, digest)
    }

    fn receipt(&self, tx: &TxHash) -> Result<Option<TxReceipt>, LedgerFault> {
        self.inner.receipt(tx)
    }

    fn get_report(&self, report_id: &str) -> Result<LedgerRecord, LedgerFault> {
        self.inner.get_report(report_id)
    }

    fn verify_hash(&self, report_id: &str, digest: &ReportDigest) -> Result<bool, LedgerFault> {
        self.inner.verify_hash(report_id, digest)
    }

    fn submit_update_status(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        status: &ReportStatus,
    ) -> Result<TxHash, LedgerFault> {
        self.inner.submit_update_status(credential, report_id, status)
    }

    fn find_store_tx(&self, report_id: &str) -> Result<Option<TxHash>, LedgerFault> {
        self.inner.find_store_tx(report_id)
    }
}

fn desk_over(
    ledger: Arc<SlowSubmits>,
    credential: Arc<SigningCredential>,
    timeout_ms: u64,
) -> ReportDesk {
    ReportDesk::new(
        Arc::new(MemoryReportStore::new()),
        Arc::new(Sha256ContentIds),
        Arc::new(AnchorClient::new(ledger, credential, settings(timeout_ms))),
    )
}

fn streetlight() -> NewReport {
    NewReport {
        description: "Broken streetlight".into(),
        location: "Main St".into(),
        category: "Infrastructure".into(),
    }
}

#[tokio::test]
async fn late_landing_submission_is_adopted_not_flagged_as_conflict() {
    let admin = Arc::new(SigningCredential::random());
    let ledger = Arc::new(SlowSubmits::new(&admin, vec![600, 300]));
    let desk = desk_over(ledger.clone(), admin, 400);

    let (record, handle) = desk.submit(streetlight(), b"photo").await.unwrap();
    assert_eq!(
        handle.await.unwrap().unwrap_err(),
        AnchorFailure::Timeout { pending_tx: None }
    );

    // The retry submits again while the first submission is still in flight;
    // it lands first and the retry is refused with the same digest stored.
    let summary = desk.reconcile_pass().await.unwrap();
    assert_eq!(
        summary,
        ReconcileSummary {
            anchored: 1,
            still_pending: 0,
            failed: 0
        }
    );
    let stored = desk.store().get(record.report_id()).unwrap();
    assert!(!stored.anchor_conflict);
    assert_eq!(
        stored.proof.map(|p| p.tx_hash),
        ledger.inner.find_store_tx(record.report_id()).unwrap()
    );
    assert_eq!(ledger.submits.load(Ordering::SeqCst), 2);
    assert_eq!(desk.reconcile_pass().await.unwrap(), ReconcileSummary::default());
}

#[tokio::test]
async fn reconcile_skips_ids_with_an_attempt_in_flight() {
    let admin = Arc::new(SigningCredential::random());
    let ledger = Arc::new(SlowSubmits::new(&admin, vec![300]));
    let desk = desk_over(ledger.clone(), admin, 2_000);

    let (record, handle) = desk.submit(streetlight(), b"photo").await.unwrap();
    let summary = desk.reconcile_pass().await.unwrap();
    assert_eq!(summary, ReconcileSummary::default());

    let proof = handle.await.unwrap().unwrap();
    assert_eq!(ledger.submits.load(Ordering::SeqCst), 1);
    assert_eq!(
        desk.store().get(record.report_id()).unwrap().proof,
        Some(proof)
    );
    assert_eq!(ledger.inner.block_number().unwrap(), 1);
}
