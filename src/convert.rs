//! Running one [`ConversionRequest`] over every file under its root.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

use crossbeam::channel;
use log::{debug, info};

use crate::{
    error::{Error, Result},
    locate::locate,
    macho,
    patch::{self, Change, Platform, Transform},
    writer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Retag every slice for the iOS Simulator.
    SimulatorTag,
    /// Retag every slice for iOS devices.
    DeviceTag,
    ToDylib,
    ToExecutable,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::SimulatorTag => "simulator tag",
            Operation::DeviceTag => "device tag",
            Operation::ToDylib => "to dylib",
            Operation::ToExecutable => "to executable",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputMode {
    #[default]
    InPlace,
    /// Write `<name><suffix>` next to each input and leave the input alone.
    Sibling { suffix: String },
}

/// Everything one invocation needs to know. Built once, read-only after.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    root: PathBuf,
    operation: Operation,
    output: OutputMode,
    install_name: Option<String>,
    reversible: bool,
    strip_code_signature: bool,
    jobs: usize,
}

impl ConversionRequest {
    pub fn new(root: impl Into<PathBuf>, operation: Operation) -> ConversionRequest {
        ConversionRequest {
            root: root.into(),
            operation,
            output: OutputMode::default(),
            install_name: None,
            reversible: false,
            strip_code_signature: false,
            jobs: 0,
        }
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Overrides the `LC_ID_DYLIB` name used by [`Operation::ToDylib`].
    pub fn install_name(mut self, name: impl Into<String>) -> Self {
        self.install_name = Some(name.into());
        self
    }

    /// Makes [`Operation::ToExecutable`] drop `LC_ID_DYLIB`.
    pub fn reversible(mut self, reversible: bool) -> Self {
        self.reversible = reversible;
        self
    }

    pub fn strip_code_signature(mut self, strip: bool) -> Self {
        self.strip_code_signature = strip;
        self
    }

    /// Worker count; 0 picks the available parallelism.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Where the converted form of `path` goes.
    pub fn destination(&self, path: &Path) -> PathBuf {
        match &self.output {
            OutputMode::InPlace => path.to_path_buf(),
            OutputMode::Sibling { suffix } => {
                let mut name = path.file_name().unwrap_or_default().to_os_string();
                name.push(suffix);
                path.with_file_name(name)
            }
        }
    }

    fn transforms(&self, dest: &Path) -> Vec<Transform> {
        let mut transforms = vec![match self.operation {
            Operation::SimulatorTag => Transform::Platform(Platform::IOS_SIMULATOR),
            Operation::DeviceTag => Transform::Platform(Platform::IOS),
            Operation::ToDylib => Transform::ToDylib {
                install_name: self
                    .install_name
                    .clone()
                    .unwrap_or_else(|| default_install_name(dest)),
            },
            Operation::ToExecutable => Transform::ToExecutable {
                remove_dylib_id: self.reversible,
            },
        }];
        if self.strip_code_signature {
            transforms.push(Transform::StripCodeSignature);
        }
        transforms
    }

    /// Drops sibling outputs from a directory walk, whether written by this
    /// run or an earlier one, so they are never converted again.
    fn without_outputs(&self, candidates: Vec<PathBuf>) -> Vec<PathBuf> {
        let suffix = match &self.output {
            OutputMode::Sibling { suffix } if !suffix.is_empty() => suffix.as_str(),
            _ => return candidates,
        };
        let outputs: HashSet<PathBuf> = candidates.iter().map(|p| self.destination(p)).collect();
        candidates
            .into_iter()
            .filter(|path| {
                let is_output = path != &self.root
                    && (outputs.contains(path)
                        || path
                            .file_name()
                            .is_some_and(|n| n.to_string_lossy().ends_with(suffix)));
                if is_output {
                    debug!("{}: skipped, sibling output", path.display());
                }
                !is_output
            })
            .collect()
    }

    fn worker_count(&self, files: usize) -> usize {
        let jobs = match self.jobs {
            0 => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            n => n,
        };
        jobs.min(files).max(1)
    }
}

/// `@rpath/<name>`, or `@rpath/<Name>.framework/<Name>` for a framework binary.
pub fn default_install_name(dest: &Path) -> String {
    let name = dest.file_name().unwrap_or_default().to_string_lossy();
    match dest.parent().and_then(Path::file_name) {
        Some(parent) if parent.to_string_lossy().ends_with(".framework") => {
            format!("@rpath/{}/{name}", parent.to_string_lossy())
        }
        _ => format!("@rpath/{name}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    Patched,
    /// The file already had the requested form; nothing was rewritten.
    AlreadyApplied,
}

/// Outcome for one file.
#[derive(Debug)]
pub struct PatchResult {
    pub path: PathBuf,
    pub output: PathBuf,
    pub outcome: Result<PatchStatus>,
}

impl PatchResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub patched: usize,
    pub already_applied: usize,
    pub failed: usize,
}

impl Summary {
    pub fn of(results: &[PatchResult]) -> Summary {
        let mut summary = Summary::default();
        for result in results {
            match result.outcome {
                Ok(PatchStatus::Patched) => summary.patched += 1,
                Ok(PatchStatus::AlreadyApplied) => summary.already_applied += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Cooperative cancellation, checked between files and between the steps
/// of one file.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// A token that also trips once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> CancelToken {
        CancelToken {
            flag: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Runs requests. Two conversions that read or write the same path never
/// overlap, even across concurrent `apply` calls on one `Converter`.
#[derive(Debug, Default)]
pub struct Converter {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Converter {
    pub fn new() -> Converter {
        Converter::default()
    }

    pub fn apply(&self, request: &ConversionRequest) -> Result<Vec<PatchResult>> {
        self.apply_with_cancel(request, &CancelToken::new())
    }

    /// Converts every file the locator finds under the request root. Only a
    /// bad root fails the call; per-file failures land in the results,
    /// which are ordered by path.
    pub fn apply_with_cancel(
        &self,
        request: &ConversionRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<PatchResult>> {
        let located = locate(request.root())?;
        let candidates = request.without_outputs(located.candidates);
        let jobs = request.worker_count(candidates.len());
        debug!(
            "{}: {} candidates, {} excluded, {jobs} workers",
            request.root().display(),
            candidates.len(),
            located.excluded.len()
        );

        let (work_tx, work_rx) = channel::unbounded::<usize>();
        let (done_tx, done_rx) = channel::unbounded();
        for i in 0..candidates.len() {
            // The receiver lives until the end of this function.
            let _ = work_tx.send(i);
        }
        drop(work_tx);

        crossbeam::scope(|s| {
            for _ in 0..jobs {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                let candidates = &candidates;
                s.spawn(move |_| {
                    for i in work_rx.iter() {
                        let outcome = match cancel.check() {
                            Ok(()) => self.convert_one(request, &candidates[i], cancel),
                            Err(e) => Err(e),
                        };
                        let _ = done_tx.send((i, outcome));
                    }
                });
            }
        })
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        drop(done_tx);

        let mut outcomes: Vec<Option<Result<PatchStatus>>> =
            candidates.iter().map(|_| None).collect();
        for (i, outcome) in done_rx.iter() {
            outcomes[i] = Some(outcome);
        }
        let mut results: Vec<PatchResult> = candidates
            .into_iter()
            .zip(outcomes)
            .map(|(path, outcome)| PatchResult {
                output: request.destination(&path),
                outcome: outcome.unwrap_or(Err(Error::Cancelled)),
                path,
            })
            .collect();
        results.extend(located.excluded.into_iter().map(|(path, source)| PatchResult {
            output: request.destination(&path),
            outcome: Err(Error::input(&path, source)),
            path,
        }));
        results.sort_by(|a, b| a.path.cmp(&b.path));
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(results)
    }

    fn path_lock(&self, key: PathBuf) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    fn convert_one(
        &self,
        request: &ConversionRequest,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<PatchStatus> {
        let dest = request.destination(path);
        // Source and destination, always locked in key order.
        let mut keys = vec![lock_key(path), lock_key(&dest)];
        keys.sort();
        keys.dedup();
        let locks: Vec<_> = keys.into_iter().map(|key| self.path_lock(key)).collect();
        let _guards: Vec<_> = locks
            .iter()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();

        cancel.check()?;
        let mut image = macho::read(path)?;
        cancel.check()?;
        let change = patch::apply_all(&mut image, &request.transforms(&dest))?;
        let status = match change {
            Change::Applied => PatchStatus::Patched,
            Change::AlreadyApplied => PatchStatus::AlreadyApplied,
        };
        if status == PatchStatus::AlreadyApplied && dest == path {
            debug!("{}: already {}", path.display(), request.operation());
            return Ok(status);
        }
        cancel.check()?;
        let staged = writer::stage(&dest, &image, path)?;
        cancel.check()?;
        staged.commit()?;
        info!("{}: {}", dest.display(), request.operation());
        Ok(status)
    }
}

/// Same file, same key: the parent is canonicalized because the file itself
/// may not exist yet.
fn lock_key(dest: &Path) -> PathBuf {
    match (dest.parent(), dest.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map_or_else(|_| dest.to_path_buf(), |p| p.join(name))
        }
        _ => dest.to_path_buf(),
    }
}

/// Runs `request` on a fresh [`Converter`].
pub fn apply(request: &ConversionRequest) -> Result<Vec<PatchResult>> {
    Converter::new().apply(request)
}
