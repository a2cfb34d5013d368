use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::{FarmError, Result};
use crate::protocol::{FunctionMessage, Target};
use crate::scheduler::job::{Allocation, Job, Status, Task};
use crate::scheduler::tree::{AllocationPicker, JobTree, Pick};
use crate::store::Store;

/// A status change applied by the scheduler, in the order it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Job { id: i64, status: Status },
    Allocation { id: i64, status: Status },
    Task { id: i64, status: Status },
}

/// An allocation handed to a worker.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job_id: i64,
    pub allocation_id: i64,
    pub message: FunctionMessage,
    pub transitions: Vec<Transition>,
}

/// Whether `computer` may be given `allocation`.
///
/// An allocation claimed by another computer stays claimed for as long as
/// that computer is connected.
pub fn check_allocation(
    allocation: &Allocation,
    computer: &str,
    connected: &HashSet<String>,
) -> bool {
    if !allocation.status.is_active() {
        return false;
    }
    match allocation.computer.as_deref() {
        None => true,
        Some(owner) if owner == computer => true,
        Some(owner) => !connected.contains(owner),
    }
}

/// Assigns allocations to workers and applies their results.
///
/// Every transition is written to the store before the tree is touched, so
/// a failed write leaves the in-memory state as it was.
#[derive(Debug)]
pub struct Scheduler {
    store: Store,
    tree: JobTree,
}

impl Scheduler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            tree: JobTree::new(),
        }
    }

    /// Build the tree from every pending or in-progress job in the store.
    ///
    /// Returns the scheduler and the allocations that were already in
    /// progress, which may belong to workers that never come back.
    pub fn load(store: Store) -> Result<(Self, Vec<i64>)> {
        let mut scheduler = Self::new(store);
        let mut in_progress = Vec::new();
        for job in scheduler
            .store
            .jobs_with_status(&[Status::Pending, Status::InProgress])?
        {
            in_progress.extend(scheduler.sync_job(job.id)?);
        }
        tracing::info!(
            jobs = scheduler.tree.active_jobs(),
            allocations = scheduler.tree.allocation_count(),
            in_progress = in_progress.len(),
            "Scheduler loaded"
        );
        Ok((scheduler, in_progress))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tree(&self) -> &JobTree {
        &self.tree
    }

    pub fn active_jobs(&self) -> usize {
        self.tree.active_jobs()
    }

    /// Pull one job and its active allocations and tasks into the tree.
    ///
    /// Safe to call again for a job already present: known allocations are
    /// left as they are. Returns the ids of attached allocations that were
    /// already in progress.
    pub fn sync_job(&mut self, job_id: i64) -> Result<Vec<i64>> {
        let job = self.store.get_job(job_id)?;
        if !job.status.is_active() {
            return Ok(Vec::new());
        }
        self.tree.upsert_job(job);

        let mut in_progress = Vec::new();
        for allocation in self.store.allocations_for_job(job_id)? {
            if !allocation.status.is_active() || self.tree.allocation(allocation.id).is_some() {
                continue;
            }
            let tasks = self
                .store
                .tasks_for_allocation(allocation.id)?
                .into_iter()
                .filter(|t| t.status.is_active())
                .collect();
            if allocation.status == Status::InProgress {
                in_progress.push(allocation.id);
            }
            self.tree.attach_allocation(allocation, tasks);
        }
        tracing::debug!(job_id, "Job synced");
        Ok(in_progress)
    }

    /// A fresh pass over every allocation in the tree, job by job.
    pub fn pick_allocation(&self) -> AllocationPicker {
        AllocationPicker::new()
    }

    /// Hand the first eligible allocation to `computer`.
    ///
    /// Returns `None` when a full pass finds nothing eligible.
    pub fn issue_task(
        &mut self,
        computer: &str,
        connected: &HashSet<String>,
    ) -> Result<Option<Assignment>> {
        let mut picker = self.pick_allocation();
        loop {
            let id = match picker.next(&self.tree) {
                Pick::Candidate(id) => id,
                Pick::EndOfPass => return Ok(None),
            };
            let eligible = self
                .tree
                .allocation(id)
                .is_some_and(|a| check_allocation(a, computer, connected));
            if !eligible {
                continue;
            }

            let transitions = self.start_allocation(computer, id)?;
            let (job_id, message) = self.allocation_message(id)?;
            tracing::info!(job_id, allocation_id = id, computer, "Allocation issued");
            return Ok(Some(Assignment {
                job_id,
                allocation_id: id,
                message,
                transitions,
            }));
        }
    }

    /// Serialize an allocation for the worker-side handler named by the
    /// job's type. Only unfinished tasks are included.
    fn allocation_message(&self, allocation_id: i64) -> Result<(i64, FunctionMessage)> {
        let allocation = self
            .tree
            .allocation(allocation_id)
            .ok_or(FarmError::AllocationNotFound(allocation_id))?;
        let job = self
            .tree
            .job(allocation.job_id)
            .ok_or(FarmError::JobNotFound(allocation.job_id))?;

        let tasks: Map<String, Value> = self
            .tree
            .tasks_of(allocation_id)
            .iter()
            .filter_map(|id| self.tree.task(*id))
            .filter(|t| t.status != Status::Done)
            .map(|t| (t.id.to_string(), Value::from(t.frame)))
            .collect();

        let message = FunctionMessage::new(Target::Client, "server", job.kind.clone())
            .kwarg("job", job.id)
            .kwarg("allocation", allocation_id)
            .kwarg("type", job.kind.clone())
            .kwarg("tasks", tasks)
            .kwarg("environment", job.environment.clone())
            .kwarg("parameters", job.parameters.clone());
        Ok((job.id, message))
    }

    pub fn start_allocation(&mut self, computer: &str, allocation_id: i64) -> Result<Vec<Transition>> {
        let mut allocation = self
            .tree
            .allocation(allocation_id)
            .cloned()
            .ok_or(FarmError::AllocationNotFound(allocation_id))?;
        allocation.status = Status::InProgress;
        allocation.computer = Some(computer.to_string());
        self.store.update_allocation(&allocation)?;

        let job_id = allocation.job_id;
        if let Some(slot) = self.tree.allocation_mut(allocation_id) {
            *slot = allocation;
        }

        let mut transitions = vec![Transition::Allocation {
            id: allocation_id,
            status: Status::InProgress,
        }];
        self.mark_job_started(job_id, &mut transitions)?;
        Ok(transitions)
    }

    pub fn start_task(&mut self, task_id: i64, computer: &str) -> Result<Vec<Transition>> {
        let mut task = self
            .tree
            .task(task_id)
            .cloned()
            .ok_or(FarmError::TaskNotFound(task_id))?;
        task.status = Status::InProgress;
        task.computer = Some(computer.to_string());
        self.store.update_task(&task)?;

        let job_id = task.job_id;
        if let Some(slot) = self.tree.task_mut(task_id) {
            *slot = task;
        }

        let mut transitions = vec![Transition::Task {
            id: task_id,
            status: Status::InProgress,
        }];
        self.mark_job_started(job_id, &mut transitions)?;
        Ok(transitions)
    }

    fn mark_job_started(&mut self, job_id: i64, transitions: &mut Vec<Transition>) -> Result<()> {
        let pending = self
            .tree
            .job(job_id)
            .is_some_and(|j| j.status == Status::Pending);
        if !pending {
            return Ok(());
        }
        self.store.set_job_status(job_id, Status::InProgress)?;
        if let Some(job) = self.tree.job_mut(job_id) {
            job.status = Status::InProgress;
        }
        transitions.push(Transition::Job {
            id: job_id,
            status: Status::InProgress,
        });
        tracing::info!(job_id, "Job started");
        Ok(())
    }

    /// Mark a task done. Finishing the last task of an allocation finishes
    /// the allocation. Calling this again for a finished task does nothing.
    pub fn finish_task(&mut self, task_id: i64) -> Result<Vec<Transition>> {
        let Some(mut task) = self.tree.task(task_id).cloned() else {
            // Already detached; only complain about ids the store never had.
            self.store.get_task(task_id)?;
            return Ok(Vec::new());
        };
        task.status = Status::Done;
        self.store.update_task(&task)?;

        let mut transitions = vec![Transition::Task {
            id: task_id,
            status: Status::Done,
        }];
        if let Some((_, 0)) = self.tree.detach_task(task_id) {
            transitions.extend(self.finish_allocation(task.allocation_id)?);
        }
        Ok(transitions)
    }

    /// Mark an allocation and every task still under it done.
    pub fn finish_allocation(&mut self, allocation_id: i64) -> Result<Vec<Transition>> {
        let Some(mut allocation) = self.tree.allocation(allocation_id).cloned() else {
            self.store.get_allocation(allocation_id)?;
            return Ok(Vec::new());
        };

        let mut transitions = Vec::new();
        for task_id in self.tree.tasks_of(allocation_id).to_vec() {
            if let Some(mut task) = self.tree.task(task_id).cloned() {
                task.status = Status::Done;
                self.store.update_task(&task)?;
                transitions.push(Transition::Task {
                    id: task_id,
                    status: Status::Done,
                });
            }
        }

        allocation.status = Status::Done;
        self.store.update_allocation(&allocation)?;
        transitions.push(Transition::Allocation {
            id: allocation_id,
            status: Status::Done,
        });
        tracing::info!(
            allocation_id,
            job_id = allocation.job_id,
            computer = allocation.computer.as_deref().unwrap_or("-"),
            "Allocation finished"
        );

        if let Some((_, 0)) = self.tree.detach_allocation(allocation_id) {
            transitions.extend(self.finish_job(allocation.job_id)?);
        }
        Ok(transitions)
    }

    /// Close a job whose last active allocation has left the tree.
    ///
    /// The job ends `done` when every allocation in the store is done and
    /// `failed` otherwise.
    pub fn finish_job(&mut self, job_id: i64) -> Result<Vec<Transition>> {
        if self.tree.job(job_id).is_none() {
            self.store.get_job(job_id)?;
            return Ok(Vec::new());
        }
        let all_done = self
            .store
            .allocations_for_job(job_id)?
            .iter()
            .all(|a| a.status == Status::Done);
        let status = if all_done { Status::Done } else { Status::Failed };

        self.store.set_job_status(job_id, status)?;
        self.tree.detach_job(job_id);
        tracing::info!(job_id, %status, active_jobs = self.tree.active_jobs(), "Job finished");
        Ok(vec![Transition::Job { id: job_id, status }])
    }

    /// Fail one task. Its allocation fails with it; sibling allocations keep
    /// running.
    pub fn fail_task(&mut self, task_id: i64, reason: &str) -> Result<Vec<Transition>> {
        let Some(mut task) = self.tree.task(task_id).cloned() else {
            self.store.get_task(task_id)?;
            return Ok(Vec::new());
        };
        task.status = Status::Failed;
        self.store.update_task(&task)?;
        tracing::warn!(task_id, frame = task.frame, reason, "Task failed");

        let mut transitions = vec![Transition::Task {
            id: task_id,
            status: Status::Failed,
        }];
        transitions.extend(self.fail_allocation(task.allocation_id, reason)?);
        Ok(transitions)
    }

    /// Fail an allocation and detach it with its tasks. The job is annotated
    /// with the failure but keeps running while other allocations remain.
    pub fn fail_allocation(&mut self, allocation_id: i64, reason: &str) -> Result<Vec<Transition>> {
        let Some(mut allocation) = self.tree.allocation(allocation_id).cloned() else {
            self.store.get_allocation(allocation_id)?;
            return Ok(Vec::new());
        };
        allocation.status = Status::Failed;
        allocation.info = Some(reason.to_string());
        self.store.update_allocation(&allocation)?;

        let job_id = allocation.job_id;
        if let Some(job) = self.tree.job_mut(job_id) {
            job.annotate_failure(allocation_id, reason);
            let metadata = job.metadata.clone();
            self.store.set_job_metadata(job_id, &metadata)?;
        }
        tracing::warn!(allocation_id, job_id, reason, "Allocation failed");

        let mut transitions = vec![Transition::Allocation {
            id: allocation_id,
            status: Status::Failed,
        }];
        if let Some((_, 0)) = self.tree.detach_allocation(allocation_id) {
            transitions.extend(self.finish_job(job_id)?);
        }
        Ok(transitions)
    }

    /// Return an allocation and all of its tasks to pending, unassigned.
    pub fn reset_allocation(&mut self, allocation_id: i64) -> Result<Vec<Transition>> {
        let mut allocation = self
            .tree
            .allocation(allocation_id)
            .cloned()
            .ok_or(FarmError::AllocationNotFound(allocation_id))?;
        let previous = allocation.computer.take();
        allocation.status = Status::Pending;
        self.store.update_allocation(&allocation)?;
        if let Some(slot) = self.tree.allocation_mut(allocation_id) {
            *slot = allocation;
        }

        let mut transitions = vec![Transition::Allocation {
            id: allocation_id,
            status: Status::Pending,
        }];
        for task_id in self.tree.tasks_of(allocation_id).to_vec() {
            transitions.extend(self.reset_task(task_id)?);
        }
        tracing::info!(
            allocation_id,
            computer = previous.as_deref().unwrap_or("-"),
            "Allocation reset"
        );
        Ok(transitions)
    }

    pub fn reset_task(&mut self, task_id: i64) -> Result<Vec<Transition>> {
        let mut task = self
            .tree
            .task(task_id)
            .cloned()
            .ok_or(FarmError::TaskNotFound(task_id))?;
        task.status = Status::Pending;
        task.computer = None;
        self.store.update_task(&task)?;
        if let Some(slot) = self.tree.task_mut(task_id) {
            *slot = task;
        }
        Ok(vec![Transition::Task {
            id: task_id,
            status: Status::Pending,
        }])
    }

    /// Reset every in-progress allocation whose computer is not connected.
    /// Returns the ids that were reset.
    pub fn reset_orphans(&mut self, connected: &HashSet<String>) -> Result<Vec<i64>> {
        let orphans: Vec<i64> = self
            .tree
            .job_ids()
            .iter()
            .flat_map(|job| self.tree.allocations_of(*job).iter().copied())
            .filter(|id| {
                self.tree.allocation(*id).is_some_and(|a| {
                    a.status == Status::InProgress
                        && a.computer.as_ref().is_some_and(|c| !connected.contains(c))
                })
            })
            .collect();

        for id in &orphans {
            self.reset_allocation(*id)?;
        }
        if !orphans.is_empty() {
            tracing::warn!(count = orphans.len(), "Orphaned allocations reset");
        }
        Ok(orphans)
    }

    /// Put a failed allocation back in the queue.
    ///
    /// Unfinished tasks return to pending and the job is reopened if it had
    /// already been closed.
    pub fn retry_allocation(&mut self, allocation_id: i64) -> Result<Vec<Transition>> {
        let mut allocation = self.store.get_allocation(allocation_id)?;
        if allocation.status != Status::Failed {
            return Err(FarmError::InvalidTransition(format!(
                "allocation {allocation_id} is {}, only failed allocations can be retried",
                allocation.status
            )));
        }

        let mut transitions = Vec::new();
        let mut job = self.store.get_job(allocation.job_id)?;
        if !job.status.is_active() {
            self.store.set_job_status(job.id, Status::Pending)?;
            job.status = Status::Pending;
            transitions.push(Transition::Job {
                id: job.id,
                status: Status::Pending,
            });
        }

        let mut tasks: Vec<Task> = Vec::new();
        for mut task in self.store.tasks_for_allocation(allocation_id)? {
            if task.status == Status::Done {
                continue;
            }
            task.status = Status::Pending;
            task.computer = None;
            self.store.update_task(&task)?;
            transitions.push(Transition::Task {
                id: task.id,
                status: Status::Pending,
            });
            tasks.push(task);
        }

        allocation.status = Status::Pending;
        allocation.computer = None;
        allocation.info = None;
        self.store.update_allocation(&allocation)?;
        transitions.push(Transition::Allocation {
            id: allocation_id,
            status: Status::Pending,
        });

        self.reattach(job, allocation, tasks);
        tracing::info!(allocation_id, "Allocation queued for retry");
        Ok(transitions)
    }

    fn reattach(&mut self, job: Job, allocation: Allocation, tasks: Vec<Task>) {
        match self.tree.job_mut(job.id) {
            Some(existing) => existing.status = job.status,
            None => self.tree.upsert_job(job),
        }
        self.tree.attach_allocation(allocation, tasks);
    }
}
