//! The map session: open documents, selection, saving, close negotiation.
//!
//! [`MapSession`] owns every open map. Opening parses the file, snapshots
//! its bytes into the [`BackupStore`], registers the document and selects
//! it; saving re-serializes against that snapshot so unedited regions of
//! the file come out byte-identical; closing negotiates unsaved changes
//! through the shell before anything is removed.
//!
//! The session talks to the rest of the editor through ports handed in at
//! construction ([`SessionPorts`]) and through the [`EventBus`] it
//! publishes on. It holds one state lock with short scopes: no port is
//! called and no file I/O happens while the lock is held, so decision
//! continuations may re-enter the session from any thread, and queries
//! like [`MapSession::fetch_selected`] never wait on a save in progress.
//! Mutating entry points are expected to be driven by a single logical
//! owner (the editor's command loop plus the continuations it hands out);
//! queries are safe from anywhere.

mod close;
mod document;

pub use close::{CloseConfirmer, CloseDecision, DecisionCallback};
pub use document::{MapDocument, MapId};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use close::PendingCloses;

use crate::backup::BackupStore;
use crate::dmm::{self, MapData, MapSize};
use crate::environment::{EnvironmentInfo, EnvironmentProvider};
use crate::error::{MapwrightError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::fs::FileSystem;
use crate::preferences::{PreferencesProvider, SavePreferences};

/// Aggregate dirty signal from the shell's edit tracking.
///
/// The session never decides modified-ness itself; the undo stack (or
/// whatever tracks edits) answers for each document by id.
pub trait ChangeTracker: Send + Sync {
    /// True when the document has edits not yet written to disk
    fn is_modified(&self, id: MapId) -> bool;

    /// Forget recorded edits after a successful save
    fn reset_modified(&self, id: MapId);
}

/// The collaborator ports a session needs, injected at construction
pub struct SessionPorts {
    /// Source of the currently-opened environment
    pub environment: Arc<dyn EnvironmentProvider>,
    /// Source of save-time preferences
    pub preferences: Arc<dyn PreferencesProvider>,
    /// Per-document dirty signal
    pub tracker: Arc<dyn ChangeTracker>,
    /// Shell dialog layer for unsaved-changes prompts
    pub confirmer: Arc<dyn CloseConfirmer>,
}

struct SessionState {
    /// Open documents in the order they were opened; tab order
    open: Vec<Arc<RwLock<MapDocument>>>,
    selected: Option<MapId>,
    /// Canonical path -> identity, memoized for the whole session
    ids_by_path: HashMap<PathBuf, MapId>,
    next_id: u64,
    pending: PendingCloses,
    /// `.dmm` files discovered under the environment root
    available: Vec<(String, PathBuf)>,
}

impl SessionState {
    fn id_for(&mut self, path: &Path) -> MapId {
        if let Some(id) = self.ids_by_path.get(path) {
            return *id;
        }
        let id = MapId::new(self.next_id);
        self.next_id += 1;
        self.ids_by_path.insert(path.to_path_buf(), id);
        id
    }

    fn position_of(&self, id: MapId) -> Option<usize> {
        self.open
            .iter()
            .position(|doc| doc.read().unwrap().id == id)
    }
}

struct SessionInner<FS: FileSystem> {
    fs: FS,
    backups: BackupStore<FS>,
    environment: Arc<dyn EnvironmentProvider>,
    preferences: Arc<dyn PreferencesProvider>,
    tracker: Arc<dyn ChangeTracker>,
    confirmer: Arc<dyn CloseConfirmer>,
    events: EventBus,
    state: Mutex<SessionState>,
}

/// The registry of open map documents.
///
/// Cheaply cloneable; clones share the same session, so close-decision
/// continuations can own a handle.
pub struct MapSession<FS: FileSystem> {
    inner: Arc<SessionInner<FS>>,
}

impl<FS: FileSystem> Clone for MapSession<FS> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<FS: FileSystem + 'static> MapSession<FS> {
    /// A session with no open documents
    pub fn new(fs: FS, backups: BackupStore<FS>, ports: SessionPorts) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                fs,
                backups,
                environment: ports.environment,
                preferences: ports.preferences,
                tracker: ports.tracker,
                confirmer: ports.confirmer,
                events: EventBus::new(),
                state: Mutex::new(SessionState {
                    open: Vec::new(),
                    selected: None,
                    ids_by_path: HashMap::new(),
                    next_id: 1,
                    pending: PendingCloses::default(),
                    available: Vec::new(),
                }),
            }),
        }
    }

    /// Bus the session publishes [`SessionEvent`]s on
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap()
    }

    // --- opening ---------------------------------------------------------

    /// Open a map file.
    ///
    /// Returns the document's identity, or `Ok(None)` when the request is
    /// a no-op: the path is not a regular file, or no environment is open.
    /// Opening an already-open map selects it instead of reopening;
    /// opening the map that is already selected does nothing at all.
    pub fn open(&self, path: &Path) -> Result<Option<MapId>> {
        let Some(env) = self.inner.environment.opened_environment() else {
            log::debug!("open ignored, no environment: {}", path.display());
            return Ok(None);
        };
        if !self.inner.fs.is_file(path) {
            log::debug!("open ignored, not a regular file: {}", path.display());
            return Ok(None);
        }
        let canonical =
            self.inner
                .fs
                .canonicalize(path)
                .map_err(|source| MapwrightError::FileRead {
                    path: path.to_path_buf(),
                    source,
                })?;

        let already_open = {
            let state = self.lock_state();
            state
                .ids_by_path
                .get(&canonical)
                .copied()
                .filter(|id| state.position_of(*id).is_some())
        };
        if let Some(id) = already_open {
            self.select(id);
            return Ok(Some(id));
        }

        let text = self.read_map_text(&canonical)?;
        let data = dmm::parse(&text).map_err(|source| MapwrightError::MapParse {
            path: canonical.clone(),
            source,
        })?;
        let unknown = env.unknown_prefab_paths(&data);

        let id = self.lock_state().id_for(&canonical);
        self.inner
            .backups
            .snapshot(id, env.name(), &canonical, text.as_bytes())?;

        {
            let mut state = self.lock_state();
            state
                .open
                .push(Arc::new(RwLock::new(MapDocument::new(id, canonical.clone(), data))));
            state.selected = Some(id);
        }
        log::info!("opened {id} from {}", canonical.display());

        self.inner
            .events
            .emit(&SessionEvent::document_opened(id, canonical));
        self.inner.events.emit(&SessionEvent::selection_changed(id));
        if !unknown.is_empty() {
            self.inner
                .events
                .emit(&SessionEvent::unknown_types_found(id, unknown));
        }
        Ok(Some(id))
    }

    /// Create a minimal map file and open it.
    ///
    /// A path that names an existing file is opened exactly as given.
    /// Otherwise a `.dmm` extension is appended when missing and a 1x1x1
    /// template is written. On success a `SizeConfigurationRequested`
    /// event asks the shell to run its resize flow; the session itself
    /// never resizes anything.
    pub fn create_new(&self, path: &Path) -> Result<Option<MapId>> {
        let path = if !self.inner.fs.exists(path)
            && path.extension().is_none_or(|ext| ext != "dmm")
        {
            let mut with_ext = path.to_path_buf().into_os_string();
            with_ext.push(".dmm");
            PathBuf::from(with_ext)
        } else {
            path.to_path_buf()
        };

        if !self.inner.fs.exists(&path) {
            let template = dmm::serialize(
                &MapData::filled(MapSize::new(1, 1, 1), Vec::new()),
                None,
                None,
                &SavePreferences::default(),
            );
            self.inner
                .fs
                .write_file(&path, &template)
                .map_err(|source| MapwrightError::FileWrite {
                    path: path.clone(),
                    source,
                })?;
        }

        let opened = self.open(&path)?;
        if let Some(id) = opened {
            self.inner
                .events
                .emit(&SessionEvent::size_configuration_requested(id));
        }
        Ok(opened)
    }

    fn read_map_text(&self, path: &Path) -> Result<String> {
        self.inner.fs.read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::InvalidData {
                MapwrightError::InvalidEncoding(path.to_path_buf())
            } else {
                MapwrightError::FileRead {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
    }

    // --- selection -------------------------------------------------------

    /// Select an open document. Re-selecting the current one, or naming
    /// an id that is not open, is a silent no-op.
    pub fn select(&self, id: MapId) {
        {
            let mut state = self.lock_state();
            if state.selected == Some(id) || state.position_of(id).is_none() {
                return;
            }
            state.selected = Some(id);
        }
        self.inner.events.emit(&SessionEvent::selection_changed(id));
    }

    /// Change the selected document's active z-level.
    ///
    /// No-op when nothing is selected, the level is out of range, or it
    /// already is the active level.
    pub fn change_selected_layer(&self, z: u32) {
        let Some(doc) = self.fetch_selected() else {
            return;
        };
        {
            let mut doc = doc.write().unwrap();
            if z == doc.selected_z || z < 1 || z > doc.depth() {
                return;
            }
            doc.selected_z = z;
        }
        self.inner.events.emit(&SessionEvent::layer_changed(z));
    }

    // --- saving ----------------------------------------------------------

    /// Save a document, re-serializing against its open-time snapshot.
    ///
    /// Writes to `target` when given ("save as", which also rebinds the
    /// document's source path and aliases its identity to the new path),
    /// otherwise to the source path. An id that is not open is a silent
    /// no-op. The snapshot is never refreshed: every save in a session
    /// diffs against the bytes the map was opened with.
    pub fn save(&self, id: MapId, target: Option<&Path>) -> Result<()> {
        let Some(doc) = self.document(id) else {
            log::debug!("save ignored, {id} is not open");
            return Ok(());
        };

        let prefs = self.inner.preferences.save_preferences();
        let env = self.inner.environment.opened_environment();
        let baseline = self.load_baseline(id);

        let (output, write_path) = {
            let doc = doc.read().unwrap();
            let write_path = target
                .map(Path::to_path_buf)
                .unwrap_or_else(|| doc.source_path.clone());
            let output = dmm::serialize(&doc.data, baseline.as_ref(), env.as_deref(), &prefs);
            (output, write_path)
        };

        self.inner
            .fs
            .write_file(&write_path, &output)
            .map_err(|source| MapwrightError::FileWrite {
                path: write_path.clone(),
                source,
            })?;

        if target.is_some() {
            let canonical = self
                .inner
                .fs
                .canonicalize(&write_path)
                .unwrap_or(write_path);
            self.lock_state().ids_by_path.insert(canonical.clone(), id);
            doc.write().unwrap().source_path = canonical;
        }

        self.inner.tracker.reset_modified(id);
        self.inner.events.emit(&SessionEvent::save_completed(id));
        Ok(())
    }

    /// Save every open document, clean or not, in tab order.
    ///
    /// Best effort: a failure is logged and collected, and the remaining
    /// documents are still saved. Returns the failures, if any.
    pub fn save_all(&self) -> Vec<(MapId, MapwrightError)> {
        let ids: Vec<MapId> = {
            let state = self.lock_state();
            state
                .open
                .iter()
                .map(|doc| doc.read().unwrap().id)
                .collect()
        };

        let mut failures = Vec::new();
        for id in ids {
            if let Err(err) = self.save(id, None) {
                log::warn!("save all: {id} failed: {err}");
                failures.push((id, err));
            }
        }
        failures
    }

    /// Baseline for diff-minimized saving, parsed fresh from the backup.
    /// Any problem with the snapshot degrades to a baseline-less save.
    fn load_baseline(&self, id: MapId) -> Option<MapData> {
        let bytes = match self.inner.backups.read(id)? {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("backup for {id} unreadable, saving without baseline: {err}");
                return None;
            }
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                log::warn!("backup for {id} is not UTF-8, saving without baseline");
                return None;
            }
        };
        match dmm::parse(&text) {
            Ok(data) => Some(data),
            Err(err) => {
                log::warn!("backup for {id} does not parse, saving without baseline: {err}");
                None
            }
        }
    }

    // --- closing ---------------------------------------------------------

    /// Close a document, negotiating unsaved changes with the shell.
    ///
    /// Clean documents close immediately. Modified ones prompt through
    /// the [`CloseConfirmer`]; the close happens (or not) whenever the
    /// user answers. A close for an id already being negotiated, or not
    /// open at all, is a silent no-op.
    pub fn close(&self, id: MapId) {
        self.negotiate_close(id, |_| {});
    }

    /// Close the selected document, if any
    pub fn close_selected(&self) {
        if let Some(id) = self.selected_id() {
            self.close(id);
        }
    }

    /// Close every open document, one negotiation at a time.
    ///
    /// Documents are negotiated in tab order against the set as it stands
    /// at each step. A cancel aborts the whole sweep: the remaining
    /// documents are never prompted for, and `done` receives `false`.
    /// `done(true)` means every document closed. A sweep requested while
    /// one is already running completes immediately with `false`.
    pub fn close_all<F>(&self, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        {
            let mut state = self.lock_state();
            if !state.pending.begin_sweep() {
                log::debug!("close all ignored, a sweep is already running");
                drop(state);
                done(false);
                return;
            }
        }
        self.close_all_step(Box::new(done));
    }

    fn close_all_step(&self, done: Box<dyn FnOnce(bool) + Send>) {
        let head = {
            let state = self.lock_state();
            state.open.first().map(|doc| doc.read().unwrap().id)
        };
        let Some(id) = head else {
            self.lock_state().pending.end_sweep();
            done(true);
            return;
        };

        let session = self.clone();
        self.negotiate_close(id, move |closed| {
            if closed {
                session.close_all_step(done);
            } else {
                session.lock_state().pending.end_sweep();
                done(false);
            }
        });
    }

    /// Drive one close request. `done(true)` once the document is gone,
    /// `done(false)` when the close did not happen: cancelled, the
    /// save-before-close failed, or the request was invalid.
    fn negotiate_close<F>(&self, id: MapId, done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        {
            let mut state = self.lock_state();
            if state.position_of(id).is_none() {
                log::debug!("close ignored, {id} is not open");
                drop(state);
                done(false);
                return;
            }
            if !state.pending.begin(id) {
                log::debug!("close ignored, {id} is already negotiating");
                drop(state);
                done(false);
                return;
            }
        }

        if !self.inner.tracker.is_modified(id) {
            self.finish_close(id);
            done(true);
            return;
        }

        let session = self.clone();
        self.inner.confirmer.request_close_confirmation(
            id,
            Box::new(move |decision| match decision {
                CloseDecision::Cancel => {
                    session.lock_state().pending.resolve(id);
                    done(false);
                }
                CloseDecision::Discard => {
                    session.finish_close(id);
                    done(true);
                }
                CloseDecision::Save => match session.save(id, None) {
                    Ok(()) => {
                        session.finish_close(id);
                        done(true);
                    }
                    Err(err) => {
                        log::warn!("save before close failed, {id} stays open: {err}");
                        session.lock_state().pending.resolve(id);
                        done(false);
                    }
                },
            }),
        );
    }

    /// Remove a document whose negotiation confirmed the close: registry
    /// removal, selection reassignment, backup disposal, events.
    fn finish_close(&self, id: MapId) {
        let events = {
            let mut state = self.lock_state();
            state.pending.resolve(id);
            let Some(pos) = state.position_of(id) else {
                return;
            };
            state.open.remove(pos);

            let mut events = vec![SessionEvent::document_closed(id)];
            if state.selected == Some(id) {
                if state.open.is_empty() {
                    state.selected = None;
                    events.push(SessionEvent::SelectionCleared);
                } else {
                    // Index continuity: the document that slid into the
                    // closed one's slot, or the new last when it was last
                    let idx = if pos == state.open.len() { pos - 1 } else { pos };
                    let next = state.open[idx].read().unwrap().id;
                    state.selected = Some(next);
                    events.push(SessionEvent::selection_changed(next));
                }
            }
            events
        };

        self.inner.backups.discard(id);
        log::info!("closed {id}");
        for event in &events {
            self.inner.events.emit(event);
        }
    }

    // --- environment -----------------------------------------------------

    /// Re-discover the `.dmm` files under the opened environment's root.
    /// With no environment open, the available list becomes empty.
    pub fn environment_changed(&self) {
        let maps = match self.inner.environment.opened_environment() {
            Some(env) => self.discover_maps(&env),
            None => Vec::new(),
        };
        self.lock_state().available = maps;
    }

    /// Drop every open document, snapshot and discovery result without
    /// negotiation or per-document events. The shell calls this when the
    /// environment itself goes away and reacts to that transition
    /// directly.
    pub fn environment_reset(&self) {
        let dropped = {
            let mut state = self.lock_state();
            let dropped = state.open.len();
            state.open.clear();
            state.selected = None;
            state.available.clear();
            state.pending.clear();
            dropped
        };
        self.inner.backups.clear();
        if dropped > 0 {
            log::info!("environment reset dropped {dropped} open maps");
        }
    }

    fn discover_maps(&self, env: &EnvironmentInfo) -> Vec<(String, PathBuf)> {
        let files = match self.inner.fs.list_dmm_files_recursive(env.root_dir()) {
            Ok(files) => files,
            Err(err) => {
                log::warn!(
                    "map discovery failed under {}: {err}",
                    env.root_dir().display()
                );
                return Vec::new();
            }
        };
        let mut maps: Vec<(String, PathBuf)> = files
            .into_iter()
            .map(|path| {
                let name = path
                    .strip_prefix(env.root_dir())
                    .unwrap_or(&path)
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                (name, path)
            })
            .collect();
        maps.sort();
        maps
    }

    // --- queries ---------------------------------------------------------

    /// Handle to the selected document, if any
    pub fn fetch_selected(&self) -> Option<Arc<RwLock<MapDocument>>> {
        let state = self.lock_state();
        let id = state.selected?;
        let pos = state.position_of(id)?;
        Some(Arc::clone(&state.open[pos]))
    }

    /// Identity of the selected document, if any
    pub fn selected_id(&self) -> Option<MapId> {
        self.lock_state().selected
    }

    /// Open documents in tab order, as (identity, source path) pairs
    pub fn list_open(&self) -> Vec<(MapId, PathBuf)> {
        self.lock_state()
            .open
            .iter()
            .map(|doc| {
                let doc = doc.read().unwrap();
                (doc.id, doc.source_path.clone())
            })
            .collect()
    }

    /// True when a document with this identity is open
    pub fn is_open(&self, id: MapId) -> bool {
        self.lock_state().position_of(id).is_some()
    }

    /// Number of open documents
    pub fn open_count(&self) -> usize {
        self.lock_state().open.len()
    }

    /// `.dmm` files discovered under the environment root, sorted by
    /// readable name
    pub fn available_maps(&self) -> Vec<(String, PathBuf)> {
        self.lock_state().available.clone()
    }

    fn document(&self, id: MapId) -> Option<Arc<RwLock<MapDocument>>> {
        let state = self.lock_state();
        let pos = state.position_of(id)?;
        Some(Arc::clone(&state.open[pos]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use std::io;

    use crate::dmm::Prefab;
    use crate::fs::InMemoryFileSystem;

    const FLAT: &str = "\"a\" = (/turf/open/floor,/area/hall)\n\"b\" = (/turf/closed/wall,/area/hall)\n\n(1,1,1) = {\"\nab\nba\n\"}\n";

    const TOWER: &str = "\"a\" = (/turf/open/floor)\n\"b\" = (/turf/closed/wall)\n\n(1,1,1) = {\"\na\n\"}\n\n(1,1,2) = {\"\nb\n\"}\n";

    #[derive(Default)]
    struct FakeTracker {
        modified: Mutex<HashSet<MapId>>,
    }

    impl FakeTracker {
        fn mark(&self, id: MapId) {
            self.modified.lock().unwrap().insert(id);
        }
    }

    impl ChangeTracker for FakeTracker {
        fn is_modified(&self, id: MapId) -> bool {
            self.modified.lock().unwrap().contains(&id)
        }

        fn reset_modified(&self, id: MapId) {
            self.modified.lock().unwrap().remove(&id);
        }
    }

    /// Answers each prompt synchronously with the next scripted decision
    #[derive(Default)]
    struct ScriptedConfirmer {
        decisions: Mutex<VecDeque<CloseDecision>>,
        asked: Mutex<Vec<MapId>>,
    }

    impl ScriptedConfirmer {
        fn script(&self, decisions: impl IntoIterator<Item = CloseDecision>) {
            self.decisions.lock().unwrap().extend(decisions);
        }

        fn asked(&self) -> Vec<MapId> {
            self.asked.lock().unwrap().clone()
        }
    }

    impl CloseConfirmer for ScriptedConfirmer {
        fn request_close_confirmation(&self, id: MapId, on_decision: DecisionCallback) {
            self.asked.lock().unwrap().push(id);
            let decision = self
                .decisions
                .lock()
                .unwrap()
                .pop_front()
                .expect("confirmation requested with no scripted decision");
            on_decision(decision);
        }
    }

    /// Parks callbacks so tests can answer prompts whenever they like
    #[derive(Default)]
    struct ParkingConfirmer {
        parked: Mutex<Vec<(MapId, DecisionCallback)>>,
    }

    impl ParkingConfirmer {
        fn answer_next(&self, decision: CloseDecision) {
            let (_, callback) = self.parked.lock().unwrap().remove(0);
            callback(decision);
        }

        fn parked_count(&self) -> usize {
            self.parked.lock().unwrap().len()
        }
    }

    impl CloseConfirmer for ParkingConfirmer {
        fn request_close_confirmation(&self, id: MapId, on_decision: DecisionCallback) {
            self.parked.lock().unwrap().push((id, on_decision));
        }
    }

    /// Fails every write to one path; everything else hits the inner fs
    struct FailingWrites {
        inner: InMemoryFileSystem,
        poisoned: PathBuf,
    }

    impl FileSystem for FailingWrites {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            self.inner.read_to_string(path)
        }
        fn read_binary(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.inner.read_binary(path)
        }
        fn write_file(&self, path: &Path, content: &str) -> io::Result<()> {
            if path == self.poisoned {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "poisoned"));
            }
            self.inner.write_file(path, content)
        }
        fn write_binary(&self, path: &Path, content: &[u8]) -> io::Result<()> {
            self.inner.write_binary(path, content)
        }
        fn create_new(&self, path: &Path, content: &str) -> io::Result<()> {
            self.inner.create_new(path, content)
        }
        fn delete_file(&self, path: &Path) -> io::Result<()> {
            self.inner.delete_file(path)
        }
        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }
        fn is_dir(&self, path: &Path) -> bool {
            self.inner.is_dir(path)
        }
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.inner.create_dir_all(path)
        }
        fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.list_files(dir)
        }
        fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
            self.inner.canonicalize(path)
        }
    }

    struct Harness {
        fs: InMemoryFileSystem,
        session: MapSession<InMemoryFileSystem>,
        tracker: Arc<FakeTracker>,
        confirmer: Arc<ScriptedConfirmer>,
        events: Arc<Mutex<Vec<SessionEvent>>>,
    }

    impl Harness {
        fn recorded(&self) -> Vec<SessionEvent> {
            self.events.lock().unwrap().clone()
        }

        fn drain_events(&self) {
            self.events.lock().unwrap().clear();
        }

        fn open(&self, path: &str) -> MapId {
            self.session.open(Path::new(path)).unwrap().unwrap()
        }
    }

    fn harness() -> Harness {
        let fs = InMemoryFileSystem::with_files(vec![
            (PathBuf::from("/env/maps/a.dmm"), FLAT.to_string()),
            (PathBuf::from("/env/maps/b.dmm"), FLAT.to_string()),
            (PathBuf::from("/env/maps/c.dmm"), FLAT.to_string()),
            (PathBuf::from("/env/maps/tower.dmm"), TOWER.to_string()),
        ]);
        let env = Arc::new(EnvironmentInfo::new("station", "/env"));
        let tracker = Arc::new(FakeTracker::default());
        let confirmer = Arc::new(ScriptedConfirmer::default());
        let backups = BackupStore::new(fs.clone(), "/backups");
        let session = MapSession::new(
            fs.clone(),
            backups,
            SessionPorts {
                environment: Arc::new(env),
                preferences: Arc::new(SavePreferences::default()),
                tracker: tracker.clone(),
                confirmer: confirmer.clone(),
            },
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        session
            .events()
            .subscribe(Arc::new(move |event| sink.lock().unwrap().push(event.clone())));

        Harness {
            fs,
            session,
            tracker,
            confirmer,
            events,
        }
    }

    fn event_types(events: &[SessionEvent]) -> Vec<&'static str> {
        events.iter().map(SessionEvent::event_type).collect()
    }

    #[test]
    fn open_registers_selects_and_announces() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");

        assert_eq!(h.session.open_count(), 1);
        assert_eq!(h.session.selected_id(), Some(id));
        assert_eq!(
            h.session.list_open(),
            vec![(id, PathBuf::from("/env/maps/a.dmm"))]
        );
        assert_eq!(
            event_types(&h.recorded()),
            vec!["DocumentOpened", "SelectionChanged"]
        );
    }

    #[test]
    fn open_same_path_twice_keeps_one_document() {
        let h = harness();
        let first = h.open("/env/maps/a.dmm");
        // Different spelling of the same file
        let second = h.open("/env/maps/../maps/./a.dmm");

        assert_eq!(first, second);
        assert_eq!(h.session.open_count(), 1);
    }

    #[test]
    fn reopening_the_selected_map_is_silent() {
        let h = harness();
        h.open("/env/maps/a.dmm");
        h.drain_events();

        h.open("/env/maps/a.dmm");
        assert!(h.recorded().is_empty());
    }

    #[test]
    fn reopening_an_unselected_map_selects_it() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        h.open("/env/maps/b.dmm");
        h.drain_events();

        let again = h.open("/env/maps/a.dmm");
        assert_eq!(again, a);
        assert_eq!(h.session.selected_id(), Some(a));
        assert_eq!(event_types(&h.recorded()), vec!["SelectionChanged"]);
    }

    #[test]
    fn open_missing_path_is_a_noop() {
        let h = harness();
        assert_eq!(h.session.open(Path::new("/env/maps/nope.dmm")).unwrap(), None);
        assert_eq!(h.session.open(Path::new("/env/maps")).unwrap(), None);
        assert_eq!(h.session.open_count(), 0);
        assert!(h.recorded().is_empty());
    }

    #[test]
    fn open_without_environment_is_a_noop() {
        struct NoEnvironment;
        impl EnvironmentProvider for NoEnvironment {
            fn opened_environment(&self) -> Option<Arc<EnvironmentInfo>> {
                None
            }
        }

        let fs = InMemoryFileSystem::with_files(vec![(
            PathBuf::from("/env/maps/a.dmm"),
            FLAT.to_string(),
        )]);
        let session = MapSession::new(
            fs.clone(),
            BackupStore::new(fs, "/backups"),
            SessionPorts {
                environment: Arc::new(NoEnvironment),
                preferences: Arc::new(SavePreferences::default()),
                tracker: Arc::new(FakeTracker::default()),
                confirmer: Arc::new(ScriptedConfirmer::default()),
            },
        );

        assert_eq!(session.open(Path::new("/env/maps/a.dmm")).unwrap(), None);
        assert_eq!(session.open_count(), 0);
    }

    #[test]
    fn malformed_map_registers_nothing() {
        let h = harness();
        h.fs
            .write_file(Path::new("/env/maps/bad.dmm"), "\"a\" = (/turf\n")
            .unwrap();

        let err = h.session.open(Path::new("/env/maps/bad.dmm")).unwrap_err();
        assert!(matches!(err, MapwrightError::MapParse { .. }));
        assert_eq!(h.session.open_count(), 0);
        assert!(h.recorded().is_empty());
    }

    #[test]
    fn open_snapshots_a_backup_used_as_save_baseline() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");

        // The file changes on disk behind the session's back; the save
        // still diffs against the open-time snapshot and restores it
        h.fs
            .write_file(Path::new("/env/maps/a.dmm"), "tampered")
            .unwrap();
        h.session.save(id, None).unwrap();
        assert_eq!(
            h.fs.read_to_string(Path::new("/env/maps/a.dmm")).unwrap(),
            FLAT
        );
    }

    #[test]
    fn unknown_prefab_paths_are_surfaced_on_open() {
        let h = harness();
        let mut env = EnvironmentInfo::new("station", "/env");
        env.register_type("/turf/open/floor", Vec::<(&str, &str)>::new());
        env.register_type("/area/hall", Vec::<(&str, &str)>::new());

        let session = MapSession::new(
            h.fs.clone(),
            BackupStore::new(h.fs.clone(), "/backups2"),
            SessionPorts {
                environment: Arc::new(Arc::new(env)),
                preferences: Arc::new(SavePreferences::default()),
                tracker: Arc::new(FakeTracker::default()),
                confirmer: Arc::new(ScriptedConfirmer::default()),
            },
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        session
            .events()
            .subscribe(Arc::new(move |event| sink.lock().unwrap().push(event.clone())));

        let id = session.open(Path::new("/env/maps/a.dmm")).unwrap().unwrap();
        let recorded = events.lock().unwrap().clone();
        assert!(recorded.contains(&SessionEvent::unknown_types_found(
            id,
            vec!["/turf/closed/wall".to_string()],
        )));
        // Unknown types warn, they do not block the open
        assert!(session.is_open(id));
    }

    #[test]
    fn select_is_idempotent_and_ignores_unknown_ids() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        h.drain_events();

        h.session.select(a);
        h.session.select(MapId::new(99));
        assert!(h.recorded().is_empty());
        assert_eq!(h.session.selected_id(), Some(a));
    }

    #[test]
    fn layer_changes_stay_within_bounds() {
        let h = harness();
        h.open("/env/maps/tower.dmm");
        h.drain_events();

        h.session.change_selected_layer(0);
        h.session.change_selected_layer(3);
        h.session.change_selected_layer(1); // already there
        assert!(h.recorded().is_empty());

        h.session.change_selected_layer(2);
        assert_eq!(h.recorded(), vec![SessionEvent::layer_changed(2)]);
        let doc = h.session.fetch_selected().unwrap();
        assert_eq!(doc.read().unwrap().selected_z, 2);
    }

    #[test]
    fn save_with_no_edits_is_byte_identical() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");
        h.session.save(id, None).unwrap();
        assert_eq!(
            h.fs.read_to_string(Path::new("/env/maps/a.dmm")).unwrap(),
            FLAT
        );
    }

    #[test]
    fn save_resets_the_dirty_counter_and_announces() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");
        h.tracker.mark(id);
        h.drain_events();

        h.session.save(id, None).unwrap();
        assert!(!h.tracker.is_modified(id));
        assert_eq!(h.recorded(), vec![SessionEvent::save_completed(id)]);
    }

    #[test]
    fn save_of_unknown_id_is_a_noop() {
        let h = harness();
        h.session.save(MapId::new(42), None).unwrap();
        assert!(h.recorded().is_empty());
    }

    #[test]
    fn editing_one_tile_changes_only_that_region() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");

        let doc = h.session.fetch_selected().unwrap();
        doc.write()
            .unwrap()
            .data
            .set_tile_content(
                1,
                1,
                1,
                vec![Prefab::new("/turf/open/lava"), Prefab::new("/area/hall")],
            )
            .unwrap();

        h.session.save(id, None).unwrap();
        let saved = h.fs.read_to_string(Path::new("/env/maps/a.dmm")).unwrap();
        // Untouched definitions keep their exact lines; the edit got a
        // fresh key appended after them
        assert!(saved.contains("\"a\" = (/turf/open/floor,/area/hall)\n"));
        assert!(saved.contains("\"b\" = (/turf/closed/wall,/area/hall)\n"));
        assert!(saved.contains("\"c\" = (/turf/open/lava,/area/hall)\n"));
        assert!(saved.contains("\nab\nca\n"));
    }

    #[test]
    fn save_as_rebinds_the_path_and_aliases_the_identity() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");

        h.session
            .save(id, Some(Path::new("/env/maps/copy.dmm")))
            .unwrap();
        assert_eq!(
            h.fs.read_to_string(Path::new("/env/maps/copy.dmm")).unwrap(),
            FLAT
        );
        let doc = h.session.fetch_selected().unwrap();
        assert_eq!(
            doc.read().unwrap().source_path,
            PathBuf::from("/env/maps/copy.dmm")
        );

        // Opening the new path finds the same open document
        assert_eq!(h.session.open(Path::new("/env/maps/copy.dmm")).unwrap(), Some(id));
        assert_eq!(h.session.open_count(), 1);
    }

    #[test]
    fn save_all_keeps_going_after_a_failure() {
        let fs = InMemoryFileSystem::with_files(vec![
            (PathBuf::from("/env/maps/a.dmm"), FLAT.to_string()),
            (PathBuf::from("/env/maps/b.dmm"), FLAT.to_string()),
        ]);
        let failing = FailingWrites {
            inner: fs.clone(),
            poisoned: PathBuf::from("/env/maps/a.dmm"),
        };
        let session = MapSession::new(
            failing,
            BackupStore::new(
                FailingWrites {
                    inner: fs.clone(),
                    poisoned: PathBuf::from("/env/maps/a.dmm"),
                },
                "/backups",
            ),
            SessionPorts {
                environment: Arc::new(Arc::new(EnvironmentInfo::new("station", "/env"))),
                preferences: Arc::new(SavePreferences::default()),
                tracker: Arc::new(FakeTracker::default()),
                confirmer: Arc::new(ScriptedConfirmer::default()),
            },
        );
        let a = session.open(Path::new("/env/maps/a.dmm")).unwrap().unwrap();
        let b = session.open(Path::new("/env/maps/b.dmm")).unwrap().unwrap();

        // Blank both files so a successful save visibly restores content
        fs.write_file(Path::new("/env/maps/a.dmm"), "").unwrap();
        fs.write_file(Path::new("/env/maps/b.dmm"), "").unwrap();

        let failures = session.save_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, a);
        assert!(matches!(failures[0].1, MapwrightError::FileWrite { .. }));

        // The second save still went through
        assert_eq!(fs.read_to_string(Path::new("/env/maps/b.dmm")).unwrap(), FLAT);
        assert!(session.is_open(a));
        assert!(session.is_open(b));
    }

    #[test]
    fn clean_close_skips_the_prompt() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");
        h.drain_events();

        h.session.close(id);
        assert!(h.confirmer.asked().is_empty());
        assert_eq!(h.session.open_count(), 0);
        assert!(!h.session.is_open(id));
        assert_eq!(
            event_types(&h.recorded()),
            vec!["DocumentClosed", "SelectionCleared"]
        );
    }

    #[test]
    fn closing_a_middle_document_selects_its_successor() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        let b = h.open("/env/maps/b.dmm");
        let c = h.open("/env/maps/c.dmm");
        h.session.select(b);
        h.drain_events();

        h.session.close(b);
        assert_eq!(h.session.selected_id(), Some(c));
        assert_eq!(
            h.recorded(),
            vec![
                SessionEvent::document_closed(b),
                SessionEvent::selection_changed(c),
            ]
        );
        let _ = a;
    }

    #[test]
    fn closing_the_last_document_selects_the_new_last() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        let b = h.open("/env/maps/b.dmm");
        h.drain_events();

        h.session.close(b);
        assert_eq!(h.session.selected_id(), Some(a));
        assert_eq!(
            h.recorded(),
            vec![
                SessionEvent::document_closed(b),
                SessionEvent::selection_changed(a),
            ]
        );
    }

    #[test]
    fn closing_an_unselected_document_keeps_the_selection() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        let b = h.open("/env/maps/b.dmm");
        h.drain_events();

        h.session.close(a);
        assert_eq!(h.session.selected_id(), Some(b));
        assert_eq!(event_types(&h.recorded()), vec!["DocumentClosed"]);
    }

    #[test]
    fn dirty_close_discard_drops_the_document() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");
        h.tracker.mark(id);
        h.confirmer.script([CloseDecision::Discard]);

        h.session.close(id);
        assert_eq!(h.confirmer.asked(), vec![id]);
        assert!(!h.session.is_open(id));
    }

    #[test]
    fn dirty_close_cancel_keeps_the_document() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");
        h.tracker.mark(id);
        h.confirmer.script([CloseDecision::Cancel]);
        h.drain_events();

        h.session.close(id);
        assert!(h.session.is_open(id));
        assert!(h.recorded().is_empty());

        // The negotiation is over; a later close may ask again
        h.confirmer.script([CloseDecision::Discard]);
        h.session.close(id);
        assert!(!h.session.is_open(id));
    }

    #[test]
    fn dirty_close_save_writes_then_closes() {
        let h = harness();
        let id = h.open("/env/maps/a.dmm");
        h.tracker.mark(id);
        h.fs.write_file(Path::new("/env/maps/a.dmm"), "").unwrap();
        h.confirmer.script([CloseDecision::Save]);

        h.session.close(id);
        assert!(!h.session.is_open(id));
        assert_eq!(
            h.fs.read_to_string(Path::new("/env/maps/a.dmm")).unwrap(),
            FLAT
        );
        assert!(!h.tracker.is_modified(id));
    }

    #[test]
    fn close_all_walks_every_document_in_order() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        let b = h.open("/env/maps/b.dmm");
        h.open("/env/maps/c.dmm");
        h.tracker.mark(a);
        h.tracker.mark(b);
        h.confirmer
            .script([CloseDecision::Discard, CloseDecision::Save]);

        let completed = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&completed);
        h.session
            .close_all(move |ok| *flag.lock().unwrap() = Some(ok));

        assert_eq!(*completed.lock().unwrap(), Some(true));
        assert_eq!(h.session.open_count(), 0);
        assert_eq!(h.confirmer.asked(), vec![a, b]);
        assert_eq!(h.session.selected_id(), None);
    }

    #[test]
    fn close_all_aborts_on_the_first_cancel() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        let b = h.open("/env/maps/b.dmm");
        h.tracker.mark(a);
        h.tracker.mark(b);
        h.confirmer.script([CloseDecision::Cancel]);

        let completed = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&completed);
        h.session
            .close_all(move |ok| *flag.lock().unwrap() = Some(ok));

        assert_eq!(*completed.lock().unwrap(), Some(false));
        // B was never prompted, both stay open
        assert_eq!(h.confirmer.asked(), vec![a]);
        assert!(h.session.is_open(a));
        assert!(h.session.is_open(b));

        // The aborted sweep released its claim; a new one may run
        h.confirmer
            .script([CloseDecision::Discard, CloseDecision::Discard]);
        let completed = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&completed);
        h.session
            .close_all(move |ok| *flag.lock().unwrap() = Some(ok));
        assert_eq!(*completed.lock().unwrap(), Some(true));
        assert_eq!(h.session.open_count(), 0);
    }

    #[test]
    fn close_all_of_an_empty_session_succeeds_immediately() {
        let h = harness();
        let completed = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&completed);
        h.session
            .close_all(move |ok| *flag.lock().unwrap() = Some(ok));
        assert_eq!(*completed.lock().unwrap(), Some(true));
    }

    #[test]
    fn unanswered_prompt_parks_only_that_negotiation() {
        let fs = InMemoryFileSystem::with_files(vec![
            (PathBuf::from("/env/maps/a.dmm"), FLAT.to_string()),
            (PathBuf::from("/env/maps/b.dmm"), FLAT.to_string()),
        ]);
        let tracker = Arc::new(FakeTracker::default());
        let confirmer = Arc::new(ParkingConfirmer::default());
        let session = MapSession::new(
            fs.clone(),
            BackupStore::new(fs, "/backups"),
            SessionPorts {
                environment: Arc::new(Arc::new(EnvironmentInfo::new("station", "/env"))),
                preferences: Arc::new(SavePreferences::default()),
                tracker: tracker.clone(),
                confirmer: confirmer.clone(),
            },
        );

        let a = session.open(Path::new("/env/maps/a.dmm")).unwrap().unwrap();
        tracker.mark(a);
        session.close(a);
        assert_eq!(confirmer.parked_count(), 1);
        assert!(session.is_open(a));

        // The session keeps working while the prompt hangs
        let b = session.open(Path::new("/env/maps/b.dmm")).unwrap().unwrap();
        session.save(b, None).unwrap();

        // A duplicate close while the prompt is pending asks nothing new
        session.close(a);
        assert_eq!(confirmer.parked_count(), 1);

        // Answering from "elsewhere" completes the original negotiation
        confirmer.answer_next(CloseDecision::Discard);
        assert!(!session.is_open(a));
        assert!(session.is_open(b));
    }

    #[test]
    fn environment_changed_discovers_maps_under_the_root() {
        let h = harness();
        h.session.environment_changed();
        let names: Vec<String> = h
            .session
            .available_maps()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec!["maps/a.dmm", "maps/b.dmm", "maps/c.dmm", "maps/tower.dmm"]
        );
    }

    #[test]
    fn environment_reset_drops_everything_silently() {
        let h = harness();
        let a = h.open("/env/maps/a.dmm");
        h.open("/env/maps/b.dmm");
        h.session.environment_changed();
        h.drain_events();

        h.session.environment_reset();
        assert_eq!(h.session.open_count(), 0);
        assert_eq!(h.session.selected_id(), None);
        assert!(h.session.available_maps().is_empty());
        assert!(h.recorded().is_empty());
        let _ = a;
    }

    #[test]
    fn reopening_after_close_keeps_the_identity() {
        let h = harness();
        let first = h.open("/env/maps/a.dmm");
        h.session.close(first);
        let second = h.open("/env/maps/a.dmm");
        assert_eq!(first, second);
    }

    #[test]
    fn create_new_writes_a_template_and_requests_sizing() {
        let h = harness();
        let id = h
            .session
            .create_new(Path::new("/env/maps/fresh"))
            .unwrap()
            .unwrap();

        assert!(h.fs.is_file(Path::new("/env/maps/fresh.dmm")));
        assert!(h.session.is_open(id));
        let recorded = h.recorded();
        assert!(recorded.contains(&SessionEvent::size_configuration_requested(id)));

        let doc = h.session.fetch_selected().unwrap();
        let doc = doc.read().unwrap();
        assert_eq!(doc.data.size(), MapSize::new(1, 1, 1));
        assert_eq!(doc.data.tile_content(1, 1, 1), Some(&Vec::new()));
    }

    #[test]
    fn create_new_over_an_existing_file_opens_it() {
        let h = harness();
        let id = h
            .session
            .create_new(Path::new("/env/maps/a.dmm"))
            .unwrap()
            .unwrap();
        // The existing content survives
        assert_eq!(
            h.fs.read_to_string(Path::new("/env/maps/a.dmm")).unwrap(),
            FLAT
        );
        assert!(h.session.is_open(id));
    }

    #[test]
    fn create_new_opens_an_existing_extensionless_file_as_named() {
        let h = harness();
        h.fs
            .write_file(Path::new("/env/maps/legacy"), FLAT)
            .unwrap();

        let id = h
            .session
            .create_new(Path::new("/env/maps/legacy"))
            .unwrap()
            .unwrap();
        assert!(h.session.is_open(id));
        // No `.dmm` sibling appears next to the existing file
        assert!(!h.fs.exists(Path::new("/env/maps/legacy.dmm")));

        let doc = h.session.fetch_selected().unwrap();
        assert_eq!(
            doc.read().unwrap().source_path,
            PathBuf::from("/env/maps/legacy")
        );
    }

    #[test]
    fn close_selected_closes_the_selected_document() {
        let h = harness();
        h.open("/env/maps/a.dmm");
        let b = h.open("/env/maps/b.dmm");

        h.session.close_selected();
        assert!(!h.session.is_open(b));
        assert_eq!(h.session.open_count(), 1);

        // Nothing selected, nothing to close
        h.session.close_selected();
        h.session.close_selected();
        assert_eq!(h.session.open_count(), 0);
    }
}
