//! Open/upgrade requests
//!
//! Opening a database is a request that may fire `upgradeneeded` before its
//! terminal event. When it does, the caller's upgrader runs with a database
//! handle bound to the upgrade transaction. A failing or panicking upgrader
//! aborts that transaction, and its error becomes the outcome of the open,
//! in preference to the `AbortError` the engine reports for the rollback.
//!
//! After a successful open, the connection watches for `versionchange` from
//! other connections and closes itself (or flags itself outdated) according
//! to [`BridgeConfig::on_version_change`](idbind_core::BridgeConfig).

use crate::database::{Connection, Database};
use crate::listener::listen;
use crate::request::{run_callback, Delivery, Request};
use crate::transaction::Transaction;
use idbind_core::{
    Error, Event, EventKind, RawDatabase, RawRequest, RawResult, ReadyState, Result,
    Scope, VersionChangePolicy,
};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// Schema upgrade callback: `(database, old_version, new_version)`
pub type Upgrader = Box<dyn FnOnce(&Database, u64, u64) -> Result<()> + Send>;

struct OpenState {
    upgrader: Mutex<Option<Upgrader>>,
    failure: Mutex<Option<Error>>,
    connection: Arc<Connection>,
}

/// A pending database open
pub struct OpenDbRequest {
    request: Request,
    state: Arc<OpenState>,
}

fn versions(event: &Event) -> Result<(u64, u64)> {
    match (event.old_version, event.new_version) {
        (Some(old), Some(new)) if old >= 0 && new >= 0 => Ok((old as u64, new as u64)),
        (Some(old), Some(new)) => Err(Error::Protocol(format!(
            "unexpected negative oldVersion or newVersion: {old}, {new}"
        ))),
        (old, new) => Err(Error::Protocol(format!(
            "upgradeneeded without versions: {old:?}, {new:?}"
        ))),
    }
}

fn replay(err: &Error) -> Error {
    match err {
        Error::Engine(e) => Error::Engine(e.clone()),
        Error::NotReady => Error::NotReady,
        Error::NotInTransaction => Error::NotInTransaction,
        Error::Aborted => Error::Aborted,
        Error::StopIteration => Error::StopIteration,
        Error::Cancelled(reason) => Error::Cancelled(*reason),
        Error::Protocol(msg) => Error::Protocol(msg.clone()),
        Error::Panicked(msg) => Error::Panicked(msg.clone()),
        Error::Config(msg) => Error::Config(msg.clone()),
        Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        Error::Other(e) => Error::Other(anyhow::anyhow!("{e:#}")),
    }
}

impl OpenState {
    fn fail(&self, raw: &dyn RawRequest, err: Error) {
        error!(target: "idbind::open", error = %err, "Upgrade failed; rolling back");
        self.failure.lock().get_or_insert(err);
        if let Some(txn) = raw.transaction() {
            if let Err(e) = txn.abort() {
                warn!(target: "idbind::open", error = %e, "Failed to abort upgrade transaction");
            }
        }
    }

    /// The upgrader's failure. The slot keeps a copy so every read of the
    /// outcome reports it.
    fn take_failure(&self) -> Option<Error> {
        let mut slot = self.failure.lock();
        let err = slot.take()?;
        *slot = Some(replay(&err));
        Some(err)
    }

    fn upgrade(&self, raw: &dyn RawRequest, event: &Event) {
        let (old, new) = match versions(event) {
            Ok(versions) => versions,
            Err(err) => return self.fail(raw, err),
        };
        let (db, txn) = match (raw.result(), raw.transaction()) {
            (Ok(RawResult::Database(db)), Some(txn)) => (db, txn),
            _ => {
                return self.fail(
                    raw,
                    Error::Protocol("upgradeneeded without a database and transaction".to_string()),
                )
            }
        };
        info!(target: "idbind::open", db = %db.name(), old, new, "Upgrading database");

        let Some(upgrader) = self.upgrader.lock().take() else {
            return;
        };
        let database = Database::new(
            db,
            Arc::clone(&self.connection),
            Some(Transaction::new(txn, None)),
        );
        match run_callback(|| upgrader(&database, old, new)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.fail(raw, err),
            Err(payload) => self.fail(raw, Error::from_panic(payload.as_ref())),
        }
    }
}

impl OpenDbRequest {
    pub(crate) fn start(
        scope: &Scope,
        raw: Arc<dyn RawRequest>,
        connection: Arc<Connection>,
        upgrader: Option<Upgrader>,
    ) -> Result<Self> {
        let state = Arc::new(OpenState {
            upgrader: Mutex::new(upgrader),
            failure: Mutex::new(None),
            connection,
        });
        let request = Request::new(raw, None);

        // The upgrade listener lives until the open settles
        let (upgrading, guard) = scope.with_cancel();
        let weak_raw = Arc::downgrade(request.raw());
        let upgrade_state = Arc::clone(&state);
        listen(&upgrading, request.raw(), EventKind::UpgradeNeeded, move |event| {
            if let Some(raw) = weak_raw.upgrade() {
                upgrade_state.upgrade(raw.as_ref(), event);
            }
        })?;
        listen(&upgrading, request.raw(), EventKind::Blocked, |event| {
            info!(
                target: "idbind::open",
                old = ?event.old_version,
                new = ?event.new_version,
                "Open blocked until other connections close"
            );
        })?;
        let settle = guard.into_handle();
        let on_success = settle.clone();
        let on_failure = settle.clone();
        request.attach(
            &upgrading,
            Delivery::Once,
            Some(Box::new(move || {
                on_success.cancel();
                Ok(())
            })),
            Some(Box::new(move |_| on_failure.cancel())),
        )?;
        if request.ready_state() == ReadyState::Done {
            settle.cancel();
        }

        Ok(Self { request, state })
    }

    /// Block until the database is open.
    ///
    /// # Errors
    ///
    /// The upgrader's error if it failed, otherwise the engine's error
    /// (`VersionError` for a downgrade, `AbortError` for a rolled-back
    /// upgrade).
    pub fn wait(&self, scope: &Scope) -> Result<Database> {
        match self.request.wait_raw(scope) {
            Err(e) if e.is_cancelled() => Err(e),
            outcome => self.finish(outcome),
        }
    }

    /// The opened database, without blocking.
    ///
    /// # Errors
    ///
    /// `NotReady` while the open is pending, otherwise the same outcome as
    /// [`OpenDbRequest::wait`].
    pub fn result(&self) -> Result<Database> {
        match self.request.raw_result() {
            Err(Error::NotReady) => Err(Error::NotReady),
            outcome => self.finish(outcome),
        }
    }

    fn finish(&self, outcome: Result<RawResult>) -> Result<Database> {
        match (outcome, self.state.take_failure()) {
            (Ok(RawResult::Database(db)), Some(failure)) => {
                db.close();
                Err(failure)
            }
            (Err(_), Some(failure)) => Err(failure),
            (Err(e), None) => Err(e),
            (Ok(RawResult::Database(db)), None) => Ok(self.connect(db)),
            (Ok(other), _) => Err(Error::Protocol(format!(
                "open produced {other:?} instead of a database"
            ))),
        }
    }

    fn connect(&self, raw: Arc<dyn RawDatabase>) -> Database {
        let connection = &self.state.connection;
        if !connection.is_watched() {
            match watch_version_changes(&raw, connection) {
                Ok(registration) => connection.set_watch(registration),
                Err(e) => {
                    warn!(target: "idbind::open", db = %raw.name(), error = %e, "Cannot watch for version changes")
                }
            }
        }
        Database::new(raw, Arc::clone(connection), None)
    }
}

fn watch_version_changes(
    raw: &Arc<dyn RawDatabase>,
    connection: &Arc<Connection>,
) -> Result<Arc<crate::listener::Registration>> {
    let db: Weak<dyn RawDatabase> = Arc::downgrade(raw);
    let watched: Weak<Connection> = Arc::downgrade(connection);
    let policy = connection.config.on_version_change;
    listen(
        &Scope::background(),
        raw,
        EventKind::VersionChange,
        move |event| {
            let (Some(db), Some(connection)) = (db.upgrade(), watched.upgrade()) else {
                return;
            };
            match policy {
                VersionChangePolicy::Close => {
                    warn!(
                        target: "idbind::open",
                        db = %db.name(),
                        old = ?event.old_version,
                        new = ?event.new_version,
                        "Version change requested elsewhere; closing connection"
                    );
                    connection.mark_outdated();
                    connection.release_watch();
                    db.close();
                }
                VersionChangePolicy::Flag => {
                    warn!(
                        target: "idbind::open",
                        db = %db.name(),
                        new = ?event.new_version,
                        "Version change requested elsewhere; connection is outdated"
                    );
                    connection.mark_outdated();
                }
            }
        },
    )
}

impl Deref for OpenDbRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.request
    }
}
