//! Reconciler — acts on fleet health monitor feedback.
//!
//! Each feedback event is checked against the current desired-state record
//! and produces at most one fleet command:
//!
//! | op       | record missing        | otherwise (after staleness checks)          |
//! |----------|-----------------------|---------------------------------------------|
//! | START    | drop                  | `start_instances` if STARTED                |
//! | STOP     | `stop` (runaway)      | `stop_instances`, or `stop` when every      |
//! |          |                       | desired instance is named                   |
//! | SPINDOWN | drop                  | `stop`, then record STOPPED, unless STOPPED |
//!
//! An event is stale when it reports a version other than the record's, or
//! reports a `last_updated` other than the record's. A missing
//! `last_updated` is not stale by itself. Comparisons are exact.
//!
//! The record is read without a lock. A write that lands between the read
//! and the command changes the version, so the monitor's next event for the
//! new version corrects any command issued against the old one.

use keel_bus::MessageBus;
use keel_core::AppRecord;
use keel_core::config::BusConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::desired::DesiredState;
use crate::feedback::{FeedbackEvent, FeedbackOp};
use crate::sink::{FleetCommandSink, StartOptions};

/// Why an event produced no command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotFound,
    NotStarted,
    AlreadyStopped,
    StaleVersion,
    StaleTimestamp,
    StoreUnavailable,
    CommandFailed,
}

/// Outcome of processing one feedback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Started,
    StoppedInstances,
    StoppedApp,
    Dropped(DropReason),
    Malformed,
}

pub struct Reconciler<S, F> {
    store: S,
    fleet: F,
}

impl<S, F> Reconciler<S, F>
where
    S: DesiredState,
    F: FleetCommandSink,
{
    pub fn new(store: S, fleet: F) -> Self {
        Self { store, fleet }
    }

    /// Parse and process a raw bus payload.
    ///
    /// A payload that does not parse is logged once at error level with its
    /// raw contents and otherwise ignored.
    pub fn handle_payload(&self, payload: &[u8]) -> Decision {
        match FeedbackEvent::from_slice(payload) {
            Ok(event) => self.process(&event),
            Err(e) => {
                error!(
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "malformed health manager feedback"
                );
                Decision::Malformed
            }
        }
    }

    pub fn process(&self, event: &FeedbackEvent) -> Decision {
        let id = event.subject_id.as_str();
        let app = match self.store.find(id) {
            Ok(app) => app,
            Err(e) => {
                error!(app_id = %id, op = ?event.op, error = %e, "failed to read desired state");
                return Decision::Dropped(DropReason::StoreUnavailable);
            }
        };

        let decision = match event.op {
            FeedbackOp::Start => self.on_start(event, app),
            FeedbackOp::Stop => self.on_stop(event, app),
            FeedbackOp::Spindown => self.on_spindown(event, app),
        };
        if let Decision::Dropped(reason) = decision {
            debug!(app_id = %id, op = ?event.op, ?reason, "feedback dropped");
        }
        decision
    }

    fn on_start(&self, event: &FeedbackEvent, app: Option<AppRecord>) -> Decision {
        let Some(app) = app else {
            return Decision::Dropped(DropReason::NotFound);
        };
        if !app.is_started() {
            return Decision::Dropped(DropReason::NotStarted);
        }
        if let Some(reason) = staleness(event, &app) {
            return Decision::Dropped(reason);
        }

        let options = StartOptions {
            flapping: event.flapping,
        };
        match self.fleet.start_instances(&app.id, &event.indices, &options) {
            Ok(()) => {
                info!(app_id = %app.id, indices = ?event.indices, flapping = ?event.flapping, "starting instances");
                Decision::Started
            }
            Err(e) => self.command_failed(&app.id, "start_instances", e),
        }
    }

    fn on_stop(&self, event: &FeedbackEvent, app: Option<AppRecord>) -> Decision {
        let Some(app) = app else {
            info!(app_id = %event.subject_id, "stopping runaway app");
            return match self.fleet.stop(&event.subject_id) {
                Ok(()) => Decision::StoppedApp,
                Err(e) => self.command_failed(&event.subject_id, "stop", e),
            };
        };
        if let Some(reason) = staleness(event, &app) {
            return Decision::Dropped(reason);
        }

        let requested = event.instances.len();
        let desired = app.desired_instances as usize;
        if requested >= desired {
            if requested > desired {
                warn!(
                    app_id = %app.id,
                    desired = app.desired_instances,
                    requested,
                    "stop would leave a negative instance count"
                );
            }
            info!(app_id = %app.id, indices = ?event.instances, "stop covers every instance, stopping app");
            return match self.fleet.stop(&app.id) {
                Ok(()) => Decision::StoppedApp,
                Err(e) => self.command_failed(&app.id, "stop", e),
            };
        }

        match self.fleet.stop_instances(&app.id, &event.instances) {
            Ok(()) => {
                info!(app_id = %app.id, indices = ?event.instances, "stopping instances");
                Decision::StoppedInstances
            }
            Err(e) => self.command_failed(&app.id, "stop_instances", e),
        }
    }

    fn on_spindown(&self, event: &FeedbackEvent, app: Option<AppRecord>) -> Decision {
        let Some(app) = app else {
            return Decision::Dropped(DropReason::NotFound);
        };
        if app.is_stopped() {
            return Decision::Dropped(DropReason::AlreadyStopped);
        }
        if let Some(reason) = staleness(event, &app) {
            return Decision::Dropped(reason);
        }

        if let Err(e) = self.fleet.stop(&app.id) {
            return self.command_failed(&app.id, "stop", e);
        }
        info!(app_id = %app.id, "spinning down app");
        if let Err(e) = self.store.record_spindown(&app.id) {
            error!(app_id = %app.id, error = %e, "failed to record spindown");
        }
        Decision::StoppedApp
    }

    fn command_failed(&self, app_id: &str, command: &str, e: impl std::fmt::Display) -> Decision {
        error!(%app_id, %command, error = %e, "fleet command failed");
        Decision::Dropped(DropReason::CommandFailed)
    }

    /// Consume feedback from the bus until shutdown is signalled.
    ///
    /// Subscribes with the configured queue group so that across all
    /// control-plane instances each event is processed once.
    pub async fn run(self, bus: MessageBus, config: BusConfig, mut shutdown: watch::Receiver<bool>) {
        let mut feedback = bus.subscribe(&config.feedback_subject, Some(&config.queue_group));
        info!(
            subject = %config.feedback_subject,
            queue = %config.queue_group,
            "reconciler listening for health manager feedback"
        );

        loop {
            tokio::select! {
                msg = feedback.next() => {
                    let Some(msg) = msg else {
                        warn!("feedback subscription closed");
                        break;
                    };
                    let decision = self.handle_payload(&msg.payload);
                    debug!(?decision, "feedback processed");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("reconciler shutting down");
                        break;
                    }
                }
            }
        }

        bus.unsubscribe(feedback.id);
    }
}

fn staleness(event: &FeedbackEvent, app: &AppRecord) -> Option<DropReason> {
    if let Some(reported) = event.reported_last_updated {
        if reported != app.last_updated {
            return Some(DropReason::StaleTimestamp);
        }
    }
    if event.reported_version.as_deref() != Some(app.version.as_str()) {
        return Some(DropReason::StaleVersion);
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{Duration, Utc};
    use keel_core::*;
    use keel_state::StateStore;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};

    use super::*;
    use crate::sink::{FleetCommand, RecordingSink};

    fn store_with_space() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_quota(&QuotaDefinition {
                id: "org-q".to_string(),
                name: "default".to_string(),
                total_routes: 100,
                total_services: 100,
                non_basic_services_allowed: true,
                memory_limit_mb: 10_240,
            })
            .unwrap();
        store
            .put_organization(&OrganizationRecord {
                id: "org-1".to_string(),
                name: "acme".to_string(),
                quota_definition_id: "org-q".to_string(),
                status: OrgStatus::Active,
            })
            .unwrap();
        store
            .put_space(&SpaceRecord {
                id: "space-1".to_string(),
                name: "dev".to_string(),
                organization_id: "org-1".to_string(),
                space_quota_definition_id: None,
            })
            .unwrap();
        store
    }

    /// A STARTED app with `instances` desired.
    fn started_app(store: &StateStore, instances: u32) -> AppRecord {
        let ctx = OperationContext::user("alice");
        let app = store.create_app(&ctx, "web", "space-1", instances, 256).unwrap();
        store.assign_droplet(&ctx, &app.id, "abc").unwrap();
        store.start_app(&ctx, &app.id).unwrap()
    }

    fn reconciler(store: &StateStore) -> (Reconciler<StateStore, RecordingSink>, RecordingSink) {
        let sink = RecordingSink::new();
        (Reconciler::new(store.clone(), sink.clone()), sink)
    }

    fn event(op: FeedbackOp, app: &AppRecord) -> FeedbackEvent {
        FeedbackEvent {
            subject_id: app.id.clone(),
            op,
            reported_version: Some(app.version.clone()),
            reported_last_updated: Some(app.last_updated),
            indices: vec![1],
            instances: vec![1],
            flapping: None,
        }
    }

    // ── START ──────────────────────────────────────────────────────

    #[test]
    fn start_current_event_starts_instances() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        assert_eq!(r.process(&event(FeedbackOp::Start, &app)), Decision::Started);
        assert_eq!(
            sink.commands(),
            vec![FleetCommand::StartInstances {
                app_id: app.id.clone(),
                indices: vec![1],
                options: StartOptions::default(),
            }]
        );
    }

    #[test]
    fn start_with_unknown_timestamp_and_matching_version_starts() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        let mut ev = event(FeedbackOp::Start, &app);
        ev.reported_last_updated = None;
        assert_eq!(r.process(&ev), Decision::Started);
        assert_eq!(sink.commands().len(), 1);
    }

    #[test]
    fn start_forwards_flapping() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        let mut ev = event(FeedbackOp::Start, &app);
        ev.flapping = Some(true);
        r.process(&ev);

        match &sink.commands()[0] {
            FleetCommand::StartInstances { options, .. } => assert_eq!(options.flapping, Some(true)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn start_stale_timestamp_dropped() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        let mut ev = event(FeedbackOp::Start, &app);
        ev.reported_last_updated = Some(app.last_updated - Duration::seconds(1));
        assert_eq!(r.process(&ev), Decision::Dropped(DropReason::StaleTimestamp));
        assert!(sink.commands().is_empty());
    }

    #[test]
    fn start_for_stopped_app_dropped() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let stopped = store.stop_app(&OperationContext::user("alice"), &app.id).unwrap();
        let (r, sink) = reconciler(&store);

        assert_eq!(
            r.process(&event(FeedbackOp::Start, &stopped)),
            Decision::Dropped(DropReason::NotStarted)
        );
        assert!(sink.commands().is_empty());
    }

    #[test]
    fn start_for_missing_app_dropped() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        store.delete_app(&OperationContext::user("alice"), &app.id).unwrap();
        let (r, sink) = reconciler(&store);

        assert_eq!(
            r.process(&event(FeedbackOp::Start, &app)),
            Decision::Dropped(DropReason::NotFound)
        );
        assert!(sink.commands().is_empty());
    }

    // ── Version mismatch, any op ───────────────────────────────────

    #[test]
    fn version_mismatch_issues_no_command_for_any_op() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        for op in [FeedbackOp::Start, FeedbackOp::Stop, FeedbackOp::Spindown] {
            let mut ev = event(op, &app);
            ev.reported_version = Some("some-older-version".to_string());
            assert_eq!(r.process(&ev), Decision::Dropped(DropReason::StaleVersion), "{op:?}");

            ev.reported_version = None;
            assert_eq!(r.process(&ev), Decision::Dropped(DropReason::StaleVersion), "{op:?}");
        }
        assert!(sink.commands().is_empty());
        assert!(store.get_app(&app.id).unwrap().unwrap().is_started());
    }

    #[test]
    fn event_from_before_an_update_is_stale() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let old = event(FeedbackOp::Start, &app);
        store.scale_app(&OperationContext::user("alice"), &app.id, 3).unwrap();
        let (r, sink) = reconciler(&store);

        assert!(matches!(r.process(&old), Decision::Dropped(_)));
        assert!(sink.commands().is_empty());
    }

    // ── STOP ───────────────────────────────────────────────────────

    #[test]
    fn stop_current_event_stops_instances() {
        let store = store_with_space();
        let app = started_app(&store, 3);
        let (r, sink) = reconciler(&store);

        let mut ev = event(FeedbackOp::Stop, &app);
        ev.instances = vec![1, 2];
        assert_eq!(r.process(&ev), Decision::StoppedInstances);
        assert_eq!(
            sink.commands(),
            vec![FleetCommand::StopInstances {
                app_id: app.id.clone(),
                indices: vec![1, 2],
            }]
        );
    }

    #[test]
    fn stop_for_absent_app_stops_runaway_once() {
        let store = store_with_space();
        let (r, sink) = reconciler(&store);

        let ev = FeedbackEvent {
            subject_id: "gone".to_string(),
            op: FeedbackOp::Stop,
            reported_version: Some("whatever".to_string()),
            reported_last_updated: Some(Utc::now()),
            indices: vec![],
            instances: vec![0],
            flapping: None,
        };
        assert_eq!(r.process(&ev), Decision::StoppedApp);
        assert_eq!(
            sink.commands(),
            vec![FleetCommand::Stop {
                app_id: "gone".to_string()
            }]
        );
    }

    /// Counts WARN events emitted while `f` runs.
    fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
        let capture = LevelCapture::new(tracing::Level::WARN);
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let result = tracing::subscriber::with_default(subscriber, f);
        let count = capture.lines.lock().unwrap().len();
        (result, count)
    }

    #[test]
    fn stop_below_zero_stops_app() {
        let store = store_with_space();
        let app = started_app(&store, 1);
        let (r, sink) = reconciler(&store);

        let mut ev = event(FeedbackOp::Stop, &app);
        ev.instances = vec![0, 1, 2];
        let (decision, warnings) = count_warnings(|| r.process(&ev));
        assert_eq!(decision, Decision::StoppedApp);
        assert_eq!(warnings, 1, "negative instance count is reported");
        assert_eq!(sink.commands(), vec![FleetCommand::Stop { app_id: app.id.clone() }]);
    }

    #[test]
    fn stop_to_exactly_zero_stops_app() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        let mut ev = event(FeedbackOp::Stop, &app);
        ev.instances = vec![0, 1];
        let (decision, warnings) = count_warnings(|| r.process(&ev));
        assert_eq!(decision, Decision::StoppedApp);
        assert_eq!(warnings, 0);
        assert_eq!(sink.commands(), vec![FleetCommand::Stop { app_id: app.id.clone() }]);
        assert!(
            store.get_app(&app.id).unwrap().unwrap().is_started(),
            "desired state is left to the API"
        );
    }

    // ── SPINDOWN ───────────────────────────────────────────────────

    #[test]
    fn spindown_stops_app_and_records_stopped() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        assert_eq!(r.process(&event(FeedbackOp::Spindown, &app)), Decision::StoppedApp);
        assert_eq!(sink.commands(), vec![FleetCommand::Stop { app_id: app.id.clone() }]);
        assert!(store.get_app(&app.id).unwrap().unwrap().is_stopped());
    }

    #[test]
    fn spindown_on_stopped_app_issues_nothing() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let stopped = store.stop_app(&OperationContext::user("alice"), &app.id).unwrap();
        let (r, sink) = reconciler(&store);

        assert_eq!(
            r.process(&event(FeedbackOp::Spindown, &stopped)),
            Decision::Dropped(DropReason::AlreadyStopped)
        );
        assert!(sink.commands().is_empty());
    }

    #[test]
    fn duplicate_spindown_is_dropped() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        let ev = event(FeedbackOp::Spindown, &app);
        assert_eq!(r.process(&ev), Decision::StoppedApp);
        assert!(matches!(r.process(&ev), Decision::Dropped(_)));
        assert_eq!(sink.commands().len(), 1);
    }

    // ── Malformed ──────────────────────────────────────────────────

    /// Collects the fields of every event at one level.
    #[derive(Clone)]
    struct LevelCapture {
        level: tracing::Level,
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl LevelCapture {
        fn new(level: tracing::Level) -> Self {
            Self {
                level,
                lines: Arc::default(),
            }
        }
    }

    struct FieldCollector<'a>(&'a mut String);

    impl Visit for FieldCollector<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.push_str(&format!("{}={:?} ", field.name(), value));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelCapture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == self.level {
                let mut line = String::new();
                event.record(&mut FieldCollector(&mut line));
                self.lines.lock().unwrap().push(line);
            }
        }
    }

    fn with_captured_errors<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
        let capture = LevelCapture::new(tracing::Level::ERROR);
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let result = tracing::subscriber::with_default(subscriber, f);
        let lines = capture.lines.lock().unwrap().clone();
        (result, lines)
    }

    #[test]
    fn malformed_payloads_log_one_error_and_issue_nothing() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        let unknown_op = format!(r#"{{"droplet":"{}","op":"RESTART","version":"{}"}}"#, app.id, app.version);
        let payloads: [&[u8]; 3] = [
            b"definitely not json",
            br#"{"op":"STOP","instances":[0]}"#,
            unknown_op.as_bytes(),
        ];

        for payload in payloads {
            let (decision, errors) = with_captured_errors(|| r.handle_payload(payload));
            assert_eq!(decision, Decision::Malformed);
            assert_eq!(errors.len(), 1, "exactly one error log");
            assert!(errors[0].contains(&*String::from_utf8_lossy(payload)));
        }
        assert!(sink.commands().is_empty());
    }

    #[test]
    fn blank_droplet_is_malformed() {
        let store = store_with_space();
        let (r, sink) = reconciler(&store);

        let payloads: [&[u8]; 2] = [
            br#"{"droplet":"","op":"STOP","version":"v1","instances":[0]}"#,
            br#"{"droplet":"   ","op":"STOP","version":"v1","instances":[0]}"#,
        ];

        for payload in payloads {
            let (decision, errors) = with_captured_errors(|| r.handle_payload(payload));
            assert_eq!(decision, Decision::Malformed);
            assert_eq!(errors.len(), 1, "exactly one error log");
            assert!(errors[0].contains("blank"));
        }
        assert!(sink.commands().is_empty(), "no runaway stop for a blank droplet");
    }

    #[test]
    fn wire_payload_round_trips_through_handle_payload() {
        let store = store_with_space();
        let app = started_app(&store, 2);
        let (r, sink) = reconciler(&store);

        let payload = serde_json::to_vec(&serde_json::json!({
            "droplet": app.id,
            "op": "START",
            "version": app.version,
            "last_updated": app.last_updated,
            "indices": [1],
        }))
        .unwrap();
        assert_eq!(r.handle_payload(&payload), Decision::Started);
        assert_eq!(sink.commands().len(), 1);
    }
}
