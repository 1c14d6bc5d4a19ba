//! Reversible-operation scaffolding.

use slog::Logger;

use super::Result;
use crate::GlobalLogger;

type Action<'a> = (String, Box<dyn FnOnce() -> Result<()> + 'a>);

/// A last-in-first-out stack of compensating actions.
///
/// Actions are pushed right after the effect they undo has succeeded.
/// Dropping an armed `Revert` runs the stack in reverse push order; each
/// action is best-effort, failures are logged and swallowed so a broken
/// undo never masks the original error. [`Revert::success`] commits the
/// operation and drops the stack without running it. [`Revert::into_hook`]
/// commits too, but hands the accumulated actions to the caller so a later
/// step outside this operation can still unwind the whole composition.
pub struct Revert<'a> {
    actions: Vec<Action<'a>>,
    armed: bool,
    logger: Logger,
}

impl<'a> Revert<'a> {
    pub fn new() -> Revert<'a> {
        Revert {
            actions: Vec::new(),
            armed: true,
            logger: GlobalLogger::get().new(o!("firn_module" => "revert")),
        }
    }

    /// Push a compensating action for an effect that just succeeded.
    pub fn add<W, F>(&mut self, what: W, action: F)
    where
        W: Into<String>,
        F: FnOnce() -> Result<()> + 'a,
    {
        self.actions.push((what.into(), Box::new(action)));
    }

    pub fn is_empty(&self) -> bool { self.actions.is_empty() }

    /// The operation succeeded; nothing will be undone.
    pub fn success(mut self) { self.armed = false; }

    /// The operation succeeded, but the caller wants to keep the ability to
    /// unwind it later.
    pub fn into_hook(mut self) -> RevertHook<'a> {
        self.armed = false;
        RevertHook {
            actions: std::mem::replace(&mut self.actions, Vec::new()),
            logger: self.logger.clone(),
        }
    }

    fn unwind(actions: &mut Vec<Action<'a>>, logger: &Logger) {
        while let Some((what, action)) = actions.pop() {
            debug!(logger, "rolling back"; "action" => %what);
            if let Err(e) = action() {
                warn!(logger, "rollback action failed"; "action" => %what, "error" => %e);
            }
        }
    }
}

impl<'a> Default for Revert<'a> {
    fn default() -> Self { Revert::new() }
}

impl<'a> Drop for Revert<'a> {
    fn drop(&mut self) {
        if self.armed {
            Self::unwind(&mut self.actions, &self.logger);
        }
    }
}

/// The rollback stack of an operation that already committed. Fires only
/// when asked to, dropping it discards the actions.
pub struct RevertHook<'a> {
    actions: Vec<Action<'a>>,
    logger: Logger,
}

impl<'a> std::fmt::Debug for RevertHook<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevertHook")
            .field("actions", &self.actions.iter().map(|(what, _)| what).collect::<Vec<_>>())
            .finish()
    }
}

impl<'a> RevertHook<'a> {
    pub fn is_empty(&self) -> bool { self.actions.is_empty() }

    /// Undo the committed operation.
    pub fn fire(mut self) { Revert::unwind(&mut self.actions, &self.logger) }

    /// Drop the actions without running them.
    pub fn discard(self) {}
}
