use std::thread;

use tracing::warn;

use crate::error::{Result, VmrepError};
use crate::writer::Writer;

/// A writer dropped from the run, and the step it failed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterFailure {
    pub writer: String,
    pub step: String,
    pub error: String,
}

/// Writers of a run. A writer that fails is moved from `active` to
/// `dropped`: it takes no further part in the run but is still released.
#[derive(Default)]
pub(crate) struct Writers {
    active: Vec<Box<dyn Writer>>,
    dropped: Vec<Box<dyn Writer>>,
}

impl Writers {
    pub(crate) fn push(&mut self, writer: Box<dyn Writer>) {
        self.active.push(writer);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn targets(&self) -> Vec<String> {
        self.active.iter().map(|w| w.target()).collect()
    }
}

/// `after_backup` on every writer, dropped ones included, so none keeps a
/// lock taken in `before_backup`.
pub(crate) fn release_writers(
    writers: &mut Writers,
    failures: &mut Vec<WriterFailure>,
) -> Result<()> {
    let previously_dropped = writers.dropped.len();
    let active = call_writers(writers, failures, "after_backup", true, |w| w.after_backup());

    let mut errors = Vec::new();
    for writer in &mut writers.dropped[..previously_dropped] {
        if let Err(e) = writer.after_backup() {
            let target = writer.target();
            warn!(writer = %target, error = %e, "failed to release dropped writer");
            errors.push(format!("{target}: {e}"));
        }
    }
    active?;
    if errors.is_empty() {
        Ok(())
    } else {
        Err(VmrepError::Other(format!(
            "failed to release writers: {}",
            errors.join("; ")
        )))
    }
}

/// Run `f` on every writer, in parallel when asked to. Writers that fail are
/// removed from the set; the run only fails once none is left.
pub(crate) fn call_writers<F>(
    writers: &mut Writers,
    failures: &mut Vec<WriterFailure>,
    step: &str,
    parallel: bool,
    f: F,
) -> Result<()>
where
    F: Fn(&mut dyn Writer) -> Result<()> + Sync,
{
    if !parallel || writers.active.len() < 2 {
        return call_writers_sequentially(writers, failures, step, |w| f(w));
    }

    let results: Vec<Result<()>> = thread::scope(|s| {
        let handles: Vec<_> = writers
            .active
            .iter_mut()
            .map(|writer| {
                let f = &f;
                s.spawn(move || f(writer.as_mut()))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(VmrepError::Other(format!("writer panicked during {step}"))))
            })
            .collect()
    });
    retain_successful(writers, failures, step, results)
}

/// Like [`call_writers`], one writer after the other, letting `f` carry state
/// from one writer to the next.
pub(crate) fn call_writers_sequentially<F>(
    writers: &mut Writers,
    failures: &mut Vec<WriterFailure>,
    step: &str,
    mut f: F,
) -> Result<()>
where
    F: FnMut(&mut dyn Writer) -> Result<()>,
{
    let results: Vec<Result<()>> = writers.active.iter_mut().map(|w| f(w.as_mut())).collect();
    retain_successful(writers, failures, step, results)
}

fn retain_successful(
    writers: &mut Writers,
    failures: &mut Vec<WriterFailure>,
    step: &str,
    results: Vec<Result<()>>,
) -> Result<()> {
    let mut errors = Vec::new();
    let mut kept = Vec::with_capacity(writers.active.len());
    for (writer, result) in std::mem::take(&mut writers.active).into_iter().zip(results) {
        match result {
            Ok(()) => kept.push(writer),
            Err(e) => {
                let target = writer.target();
                warn!(writer = %target, step, error = %e, "writer failed, removing it from the run");
                errors.push(format!("{target}: {e}"));
                failures.push(WriterFailure {
                    writer: target,
                    step: step.to_string(),
                    error: e.to_string(),
                });
                writers.dropped.push(writer);
            }
        }
    }
    writers.active = kept;

    if writers.active.is_empty() && !errors.is_empty() {
        return Err(VmrepError::AllTargetsFailed {
            step: step.to_string(),
            errors,
        });
    }
    Ok(())
}
