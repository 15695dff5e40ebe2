//! Resource actions
//!
//! A resource is one named remote thing (`github://owner/repo/ref/...`).
//! `create` runs the requested action for the first time and records it;
//! `update` replays the create-time action and arguments against the current
//! remote state; `remove` deletes every file the store attributes to the
//! resource, then the rows. After a successful update, sources that the
//! platform no longer emits are purged with their destinations.

use std::collections::HashSet;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::core::destination::remove_existing;
use crate::core::engine::Engine;
use crate::core::source::{ActionArgs, Source};
use crate::core::store::{Action, ResourceRow};
use crate::error::{Error, Failure, Result};

/// What the task asks of this resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// First materialization with the given action
    Create(Action),
    /// Replay the stored action against current remote state
    Update,
    /// Delete files and rows
    Remove,
}

pub struct Resource {
    tsk_id: i64,
    res_id: Option<i64>,
    name: String,
    action: Option<Action>,
    args: ActionArgs,
}

impl Resource {
    /// Resource for a `create`-class action; looks up any existing row so
    /// the precondition can refuse a double install.
    pub fn for_create(
        eng: &Engine,
        tsk_id: i64,
        name: &str,
        action: Action,
        args: ActionArgs,
    ) -> Result<Resource> {
        let existing = eng.store.resource_by_name(name)?;
        Ok(Resource {
            tsk_id,
            res_id: existing.map(|r| r.id),
            name: name.to_string(),
            action: Some(action),
            args,
        })
    }

    /// Resource rehydrated from its store row for `update`/`remove`; the
    /// stored action and arguments are replayed.
    pub fn from_row(tsk_id: i64, row: &ResourceRow) -> Resource {
        let args = row
            .arguments
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();
        Resource {
            tsk_id,
            res_id: Some(row.id),
            name: row.name.clone(),
            action: Action::parse(&row.action),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the task action. Failures are aggregated per source rather than
    /// aborting the first time something goes wrong.
    pub fn apply(&mut self, eng: &Engine, task_action: TaskAction, force: bool) -> Vec<Failure> {
        let outcome = match task_action {
            TaskAction::Create(action) => self.create(eng, action, force),
            TaskAction::Update => self.update(eng, force),
            TaskAction::Remove => self.remove(eng).map(|()| Vec::new()),
        };
        match outcome {
            Ok(failures) => failures,
            Err(error) => vec![Failure {
                resource: self.name.clone(),
                source: None,
                error,
            }],
        }
    }

    fn create(&mut self, eng: &Engine, action: Action, force: bool) -> Result<Vec<Failure>> {
        if self.res_id.is_some() && !force {
            return Err(Error::Invalid(format!("already installed: {}", self.name)));
        }

        let arguments = serde_json::to_string(&self.args)
            .map_err(|e| Error::Other(e.into()))?;
        let res_id = eng.store.upsert_resource(
            self.tsk_id,
            self.res_id,
            Some(&self.name),
            Some(action),
            Some(&arguments),
            None,
        )?;
        self.res_id = Some(res_id);
        self.action = Some(action);

        info!(resource = %self.name, action = action.as_str(), "create");
        Ok(self.do_action(eng, action, false, force))
    }

    fn update(&mut self, eng: &Engine, force: bool) -> Result<Vec<Failure>> {
        let res_id = self
            .res_id
            .ok_or_else(|| Error::Invalid(format!("not installed: {}", self.name)))?;
        let action = self
            .action
            .ok_or_else(|| Error::Invalid(format!("unknown action for: {}", self.name)))?;

        info!(resource = %self.name, action = action.as_str(), "update");
        let failures = self.do_action(eng, action, true, force);

        if failures.is_empty() {
            // Stamp the resource with the task that last touched it.
            eng.store
                .upsert_resource(self.tsk_id, Some(res_id), None, None, None, None)?;
        }
        Ok(failures)
    }

    fn remove(&mut self, eng: &Engine) -> Result<()> {
        let res_id = self
            .res_id
            .ok_or_else(|| Error::Invalid(format!("not installed: {}", self.name)))?;

        info!(resource = %self.name, "remove");
        for src_row in eng.store.sources_by_resource(res_id)? {
            remove_source(eng, src_row.id)?;
        }
        eng.store.delete_resource(res_id)?;
        self.res_id = None;
        Ok(())
    }

    /// Run the action over every source the platform emits, concurrently,
    /// then reconcile orphans once all writes have landed.
    fn do_action(
        &self,
        eng: &Engine,
        action: Action,
        update: bool,
        force: bool,
    ) -> Vec<Failure> {
        let res_id = self.res_id.expect("action requires a resource row");

        let sources = match eng
            .platforms
            .for_resource(&self.name)
            .and_then(|platform| platform.sources(eng, &self.name, res_id))
        {
            Ok(sources) => sources,
            Err(error) => {
                return vec![Failure {
                    resource: self.name.clone(),
                    source: None,
                    error,
                }]
            }
        };

        let results: Vec<(Source, Option<Error>)> = sources
            .into_par_iter()
            .map(|mut source| {
                let result = match action {
                    Action::Download => {
                        source.download(eng, &self.args, update, force, self.tsk_id)
                    }
                    Action::Extract => {
                        source.extract(eng, &self.args, update, force, self.tsk_id)
                    }
                    Action::Install => {
                        source.install(eng, &self.args, update, force, self.tsk_id)
                    }
                };
                (source, result.err())
            })
            .collect();

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for (source, error) in results {
            match error {
                Some(error) => failures.push(Failure {
                    resource: self.name.clone(),
                    source: Some(source.name().to_string()),
                    error,
                }),
                None => succeeded.push(source),
            }
        }
        // Writes from failed peers stay committed; reconciliation would
        // mistake them for orphans, so it only runs on full success.
        if !failures.is_empty() {
            return failures;
        }

        if let Err(error) = self.reconcile(eng, res_id, &succeeded) {
            failures.push(Failure {
                resource: self.name.clone(),
                source: None,
                error,
            });
        }
        failures
    }

    /// Per-source orphan purge, then drop sources the platform stopped
    /// emitting (cascades to their destinations).
    fn reconcile(&self, eng: &Engine, res_id: i64, sources: &[Source]) -> Result<()> {
        for source in sources {
            source.remove_orphans(eng)?;
        }

        let live: HashSet<i64> = sources
            .iter()
            .filter_map(|source| source.src_id())
            .collect();
        for src_row in eng.store.sources_by_resource(res_id)? {
            if !live.contains(&src_row.id) {
                debug!(source = %src_row.name, "removing orphan source");
                remove_source(eng, src_row.id)?;
            }
        }
        Ok(())
    }
}

/// Delete a source's files from disk, then its rows.
fn remove_source(eng: &Engine, src_id: i64) -> Result<()> {
    for dst_row in eng.store.destinations_by_source(src_id)? {
        remove_existing(Path::new(&dst_row.path))?;
    }
    eng.store.delete_source(src_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn seeded(eng: &Engine, name: &str) -> (i64, i64) {
        let tsk = eng.store.new_task().unwrap();
        let res = eng
            .store
            .upsert_resource(
                tsk,
                None,
                Some(name),
                Some(Action::Download),
                Some("{}"),
                None,
            )
            .unwrap();
        (tsk, res)
    }

    #[test]
    fn create_refuses_an_installed_resource() {
        let tmp = tempdir().unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let (tsk, _) = seeded(&eng, "github://acme/proj/v1/a.bin");

        let mut resource = Resource::for_create(
            &eng,
            tsk,
            "github://acme/proj/v1/a.bin",
            Action::Download,
            ActionArgs::default(),
        )
        .unwrap();
        let failures = resource.apply(&eng, TaskAction::Create(Action::Download), false);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, Error::Invalid(_)));
    }

    #[test]
    fn update_refuses_an_absent_resource() {
        let tmp = tempdir().unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let tsk = eng.store.new_task().unwrap();

        let row = ResourceRow {
            id: 0,
            tsk_id: tsk,
            name: "github://acme/proj/v1".into(),
            action: "download".into(),
            arguments: None,
        };
        let mut resource = Resource::from_row(tsk, &row);
        resource.res_id = None;
        let failures = resource.apply(&eng, TaskAction::Update, false);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, Error::Invalid(_)));
    }

    #[test]
    fn remove_deletes_files_and_rows() {
        let tmp = tempdir().unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let (tsk, res) = seeded(&eng, "github://acme/proj/v1/a.bin");

        let src = eng
            .store
            .upsert_source(tsk, res, None, Some("a.bin"), None, None, None)
            .unwrap();
        let on_disk = tmp.path().join("a.bin");
        fs::write(&on_disk, b"payload").unwrap();
        eng.store
            .upsert_destination(
                tsk,
                res,
                src,
                &on_disk.to_string_lossy(),
                None,
                &Default::default(),
                None,
            )
            .unwrap();

        let row = eng
            .store
            .resource_by_name("github://acme/proj/v1/a.bin")
            .unwrap()
            .unwrap();
        let mut resource = Resource::from_row(tsk, &row);
        let failures = resource.apply(&eng, TaskAction::Remove, false);
        assert!(failures.is_empty());

        assert!(!on_disk.exists());
        assert!(eng
            .store
            .resource_by_name("github://acme/proj/v1/a.bin")
            .unwrap()
            .is_none());
        assert!(eng.store.source(res, "a.bin").unwrap().is_none());
        assert!(eng.store.destinations_by_source(src).unwrap().is_empty());
    }

    #[test]
    fn remove_twice_is_invalid() {
        let tmp = tempdir().unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let (tsk, _) = seeded(&eng, "github://acme/proj/v1");

        let row = eng
            .store
            .resource_by_name("github://acme/proj/v1")
            .unwrap()
            .unwrap();
        let mut resource = Resource::from_row(tsk, &row);
        assert!(resource.apply(&eng, TaskAction::Remove, false).is_empty());
        let failures = resource.apply(&eng, TaskAction::Remove, false);
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn unknown_scheme_fails_the_resource() {
        let tmp = tempdir().unwrap();
        let eng = Engine::rooted_at(tmp.path()).unwrap();
        let tsk = eng.store.new_task().unwrap();

        let mut resource = Resource::for_create(
            &eng,
            tsk,
            "sourceforge://acme/proj",
            Action::Download,
            ActionArgs::default(),
        )
        .unwrap();
        let failures = resource.apply(&eng, TaskAction::Create(Action::Download), false);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, Error::Invalid(_)));
        assert!(failures[0].source.is_none());
    }
}
