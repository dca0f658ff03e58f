//! Commands and the interceptor chain they run through.
//!
//! Every externally triggered unit of work is a [`Command`]. The executor
//! passes it through its interceptors in order; the innermost step opens a
//! [`CommandContext`], runs the command, flushes the context and commits the
//! resulting change set. A failing command commits nothing.

use crate::context::{CommandContext, EngineServices};
use crate::error::EngineError;
use std::sync::Arc;
use std::time::Instant;

/// A unit of work executed inside a command context.
///
/// `execute` may run more than once when the retry interceptor re-runs a
/// command after an optimistic-lock conflict, so it takes `&self`.
pub trait Command {
    type Output;

    fn name(&self) -> &'static str;

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<Self::Output, EngineError>;
}

/// Wraps the rest of the chain.
pub trait CommandInterceptor: Send + Sync {
    fn intercept(
        &self,
        command: &'static str,
        next: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError>;
}

/// Opens a span per command and logs its outcome and duration.
#[derive(Debug, Default)]
pub struct LogInterceptor;

impl CommandInterceptor for LogInterceptor {
    fn intercept(
        &self,
        command: &'static str,
        next: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let span = tracing::debug_span!("command", name = command);
        let _guard = span.enter();
        let started = Instant::now();
        let result = next();
        let elapsed_us = saturating_micros(started.elapsed());
        match &result {
            Ok(()) => tracing::debug!(elapsed_us, "command complete"),
            Err(e) => tracing::debug!(elapsed_us, code = e.error_code(), error = %e, "command failed"),
        }
        result
    }
}

fn saturating_micros(elapsed: std::time::Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

/// Re-runs the rest of the chain after optimistic-lock conflicts.
#[derive(Debug)]
pub struct RetryInterceptor {
    max_retries: u32,
}

impl RetryInterceptor {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl CommandInterceptor for RetryInterceptor {
    fn intercept(
        &self,
        command: &'static str,
        next: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            match next() {
                Err(e) if e.is_optimistic_lock() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(command, attempt, error = %e, "optimistic lock conflict, retrying");
                }
                result => return result,
            }
        }
    }
}

/// Runs commands through the interceptor chain.
pub struct CommandExecutor {
    services: Arc<EngineServices>,
    interceptors: Vec<Box<dyn CommandInterceptor>>,
}

impl CommandExecutor {
    pub fn new(
        services: Arc<EngineServices>,
        interceptors: Vec<Box<dyn CommandInterceptor>>,
    ) -> Self {
        Self {
            services,
            interceptors,
        }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn execute<C: Command + ?Sized>(&self, command: &C) -> Result<C::Output, EngineError> {
        let name = command.name();
        let mut output = None;
        let mut innermost = || -> Result<(), EngineError> {
            output = Some(self.run_in_context(command)?);
            Ok(())
        };
        self.invoke(0, name, &mut innermost)?;
        output.ok_or(EngineError::NotExecuted(name))
    }

    fn invoke(
        &self,
        index: usize,
        name: &'static str,
        last: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        match self.interceptors.get(index) {
            Some(interceptor) => {
                interceptor.intercept(name, &mut || self.invoke(index + 1, name, &mut *last))
            }
            None => last(),
        }
    }

    fn run_in_context<C: Command + ?Sized>(&self, command: &C) -> Result<C::Output, EngineError> {
        let mut ctx = CommandContext::new(&self.services, command.name());
        let output = command.execute(&mut ctx)?;
        let flush = ctx.flush()?;
        if !flush.changes.is_empty() {
            self.services.store.commit(flush.changes)?;
        }
        if flush.touches_jobs {
            self.services.job_notify.notify_one();
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ProcessEngine;
    use parking_lot::Mutex;
    use tokenflow_storage::{EntityKind, StorageError};

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl CommandInterceptor for Recording {
        fn intercept(
            &self,
            command: &'static str,
            next: &mut dyn FnMut() -> Result<(), EngineError>,
        ) -> Result<(), EngineError> {
            self.log.lock().push(format!("{} > {}", self.label, command));
            let result = next();
            self.log.lock().push(format!("{} <", self.label));
            result
        }
    }

    /// Fails with a lock conflict a fixed number of times.
    struct Flaky {
        failures: Mutex<u32>,
    }

    impl Command for Flaky {
        type Output = u32;

        fn name(&self) -> &'static str {
            "Flaky"
        }

        fn execute(&self, _ctx: &mut CommandContext<'_>) -> Result<u32, EngineError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StorageError::OptimisticLock {
                    kind: EntityKind::Execution,
                    id: "e1".into(),
                    expected: 1,
                    actual: Some(2),
                }
                .into());
            }
            Ok(42)
        }
    }

    #[test]
    fn test_elapsed_micros_saturate() {
        assert_eq!(saturating_micros(std::time::Duration::from_millis(3)), 3_000);
        assert_eq!(saturating_micros(std::time::Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_interceptors_run_in_order() {
        let engine = ProcessEngine::builder().build();
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = CommandExecutor::new(
            Arc::clone(engine.services()),
            vec![
                Box::new(Recording {
                    label: "outer",
                    log: Arc::clone(&log),
                }),
                Box::new(Recording {
                    label: "inner",
                    log: Arc::clone(&log),
                }),
            ],
        );
        let output = executor
            .execute(&Flaky {
                failures: Mutex::new(0),
            })
            .unwrap();
        assert_eq!(output, 42);
        assert_eq!(
            *log.lock(),
            vec!["outer > Flaky", "inner > Flaky", "inner <", "outer <"]
        );
    }

    #[test]
    fn test_retry_interceptor_bounds_attempts() {
        let engine = ProcessEngine::builder().build();
        let executor = CommandExecutor::new(
            Arc::clone(engine.services()),
            vec![Box::new(LogInterceptor), Box::new(RetryInterceptor::new(2))],
        );

        let twice = Flaky {
            failures: Mutex::new(2),
        };
        assert_eq!(executor.execute(&twice).unwrap(), 42);

        let thrice = Flaky {
            failures: Mutex::new(3),
        };
        let err = executor.execute(&thrice).unwrap_err();
        assert!(err.is_optimistic_lock());
        assert_eq!(*thrice.failures.lock(), 0);
    }
}
