//! Top-level transaction
//!
//! One task spans every resource named on the command line. Inputs expand to
//! exact names for create-class actions and to store globs for
//! `update`/`remove`. Resources fan out over the worker pool; failures are
//! collected, not fatal to peers, and reported together at the end. The
//! cache expiry sweep runs at teardown.

use std::collections::HashSet;

use rayon::prelude::*;
use tracing::debug;

use crate::core::engine::Engine;
use crate::core::resource::{Resource, TaskAction};
use crate::core::source::ActionArgs;
use crate::error::{Error, Failure, Result, TaskError};

pub struct Task<'e> {
    eng: &'e Engine,
    tsk_id: i64,
}

impl<'e> Task<'e> {
    /// Start a transaction: one `tsk` row, stamped now.
    pub fn begin(eng: &'e Engine) -> Result<Task<'e>> {
        let tsk_id = eng.store.new_task()?;
        debug!(tsk_id, "task started");
        Ok(Task { eng, tsk_id })
    }

    pub fn tsk_id(&self) -> i64 {
        self.tsk_id
    }

    /// Run the action over every input. With `debug` the first failure
    /// aborts immediately; otherwise failures aggregate into one composite
    /// error naming each failed (resource, source) pair.
    pub fn run(
        &self,
        inputs: &[String],
        action: TaskAction,
        args: &ActionArgs,
        force: bool,
        debug: bool,
    ) -> std::result::Result<(), TaskError> {
        let (mut resources, mut failures) = self.expand(inputs, action, args);

        if debug {
            for resource in &mut resources {
                let found = resource.apply(self.eng, action, force);
                if !found.is_empty() {
                    failures.extend(found);
                    break;
                }
            }
        } else {
            failures.extend(
                resources
                    .par_iter_mut()
                    .flat_map(|resource| resource.apply(self.eng, action, force))
                    .collect::<Vec<_>>(),
            );
        }

        // Lazy cache expiry happens once per task, at teardown.
        self.eng.cache.sweep();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TaskError { failures })
        }
    }

    /// Expand inputs into resources: glob-matched store rows for
    /// update/remove, exact names otherwise.
    fn expand(
        &self,
        inputs: &[String],
        action: TaskAction,
        args: &ActionArgs,
    ) -> (Vec<Resource>, Vec<Failure>) {
        let mut resources = Vec::new();
        let mut failures = Vec::new();

        // Duplicate inputs (or overlapping globs) touch a resource once.
        let inputs: Vec<&String> = {
            let mut seen = HashSet::new();
            inputs.iter().filter(|name| seen.insert(*name)).collect()
        };

        match action {
            TaskAction::Update | TaskAction::Remove => {
                let mut matched = HashSet::new();
                for pattern in inputs {
                    let rows = match self.eng.store.resources_by_glob(pattern) {
                        Ok(rows) => rows,
                        Err(error) => {
                            failures.push(Failure {
                                resource: pattern.clone(),
                                source: None,
                                error,
                            });
                            continue;
                        }
                    };
                    if rows.is_empty() {
                        failures.push(Failure {
                            resource: pattern.clone(),
                            source: None,
                            error: Error::Invalid(format!(
                                "no installed resource matches: {pattern}"
                            )),
                        });
                        continue;
                    }
                    for row in rows {
                        if matched.insert(row.id) {
                            resources.push(Resource::from_row(self.tsk_id, &row));
                        }
                    }
                }
            }
            TaskAction::Create(create_action) => {
                for name in inputs {
                    match Resource::for_create(
                        self.eng,
                        self.tsk_id,
                        name,
                        create_action,
                        args.clone(),
                    ) {
                        Ok(resource) => resources.push(resource),
                        Err(error) => failures.push(Failure {
                            resource: name.clone(),
                            source: None,
                            error,
                        }),
                    }
                }
            }
        }

        (resources, failures)
    }
}
