//! In-memory mirror of the active part of the store.
//!
//! Jobs, allocations and tasks live in flat maps keyed by id; parent/child
//! links are ids, never references. Only pending and in-progress records are
//! kept, finished or failed ones are detached as they leave that state.

use std::collections::{HashMap, HashSet};

use crate::scheduler::job::{Allocation, Job, Task};

#[derive(Debug, Clone)]
struct JobNode {
    job: Job,
    allocations: Vec<i64>,
}

#[derive(Debug, Clone)]
struct AllocationNode {
    allocation: Allocation,
    tasks: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct JobTree {
    jobs: HashMap<i64, JobNode>,
    /// Job ids in admission order; traversal is job-major over this list.
    order: Vec<i64>,
    allocations: HashMap<i64, AllocationNode>,
    tasks: HashMap<i64, Task>,
    active_jobs: usize,
}

impl JobTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job, or update it if already present. Allocations and tasks
    /// not yet in the tree are attached; known ones are left alone.
    pub fn upsert_job(&mut self, job: Job) {
        match self.jobs.get_mut(&job.id) {
            Some(node) => node.job = job,
            None => {
                self.order.push(job.id);
                self.jobs.insert(
                    job.id,
                    JobNode {
                        job,
                        allocations: Vec::new(),
                    },
                );
                self.active_jobs += 1;
            }
        }
    }

    /// Attach an allocation and its tasks under their job. Returns false if
    /// the job is not in the tree or the allocation already is.
    pub fn attach_allocation(&mut self, allocation: Allocation, tasks: Vec<Task>) -> bool {
        if self.allocations.contains_key(&allocation.id) {
            return false;
        }
        let Some(job) = self.jobs.get_mut(&allocation.job_id) else {
            return false;
        };
        job.allocations.push(allocation.id);

        let task_ids = tasks.iter().map(|t| t.id).collect();
        for task in tasks {
            self.tasks.insert(task.id, task);
        }
        self.allocations.insert(
            allocation.id,
            AllocationNode {
                allocation,
                tasks: task_ids,
            },
        );
        true
    }

    pub fn job(&self, id: i64) -> Option<&Job> {
        self.jobs.get(&id).map(|n| &n.job)
    }

    pub fn job_mut(&mut self, id: i64) -> Option<&mut Job> {
        self.jobs.get_mut(&id).map(|n| &mut n.job)
    }

    pub fn allocation(&self, id: i64) -> Option<&Allocation> {
        self.allocations.get(&id).map(|n| &n.allocation)
    }

    pub fn allocation_mut(&mut self, id: i64) -> Option<&mut Allocation> {
        self.allocations.get_mut(&id).map(|n| &mut n.allocation)
    }

    pub fn task(&self, id: i64) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: i64) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    /// Job ids in traversal order.
    pub fn job_ids(&self) -> &[i64] {
        &self.order
    }

    /// Active allocations of a job, in split order.
    pub fn allocations_of(&self, job_id: i64) -> &[i64] {
        self.jobs
            .get(&job_id)
            .map(|n| n.allocations.as_slice())
            .unwrap_or(&[])
    }

    /// Active tasks of an allocation, in frame order.
    pub fn tasks_of(&self, allocation_id: i64) -> &[i64] {
        self.allocations
            .get(&allocation_id)
            .map(|n| n.tasks.as_slice())
            .unwrap_or(&[])
    }

    /// Remove a task. Returns it with the number of tasks still attached to
    /// its allocation.
    pub fn detach_task(&mut self, id: i64) -> Option<(Task, usize)> {
        let task = self.tasks.remove(&id)?;
        let remaining = match self.allocations.get_mut(&task.allocation_id) {
            Some(node) => {
                node.tasks.retain(|t| *t != id);
                node.tasks.len()
            }
            None => 0,
        };
        Some((task, remaining))
    }

    /// Remove an allocation and any tasks still under it. Returns it with
    /// the number of allocations still attached to its job.
    pub fn detach_allocation(&mut self, id: i64) -> Option<(Allocation, usize)> {
        let node = self.allocations.remove(&id)?;
        for task in &node.tasks {
            self.tasks.remove(task);
        }
        let remaining = match self.jobs.get_mut(&node.allocation.job_id) {
            Some(job) => {
                job.allocations.retain(|a| *a != id);
                job.allocations.len()
            }
            None => 0,
        };
        Some((node.allocation, remaining))
    }

    /// Remove a job and everything still under it.
    pub fn detach_job(&mut self, id: i64) -> Option<Job> {
        let node = self.jobs.remove(&id)?;
        for allocation in &node.allocations {
            if let Some(alloc) = self.allocations.remove(allocation) {
                for task in &alloc.tasks {
                    self.tasks.remove(task);
                }
            }
        }
        self.order.retain(|j| *j != id);
        self.active_jobs = self.active_jobs.saturating_sub(1);
        Some(node.job)
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// One step of an allocation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    Candidate(i64),
    /// No eligible allocation was found in this pass.
    EndOfPass,
}

/// Lazy, restartable walk over every allocation in the tree, job by job.
///
/// Each step rereads the tree and yields the first allocation not yet
/// returned in this pass, so detaching or appending records between steps
/// never skips a survivor. Each pass ends with [`Pick::EndOfPass`]; calling
/// [`AllocationPicker::next`] after that starts a new pass.
#[derive(Debug, Default)]
pub struct AllocationPicker {
    seen: HashSet<i64>,
}

impl AllocationPicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, tree: &JobTree) -> Pick {
        let next = tree
            .order
            .iter()
            .flat_map(|job_id| tree.allocations_of(*job_id))
            .find(|id| !self.seen.contains(*id))
            .copied();
        match next {
            Some(id) => {
                self.seen.insert(id);
                Pick::Candidate(id)
            }
            None => {
                self.seen.clear();
                Pick::EndOfPass
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Status;
    use crate::scheduler::range::FrameRange;

    fn job(id: i64) -> Job {
        Job::new(id, format!("job{id}"), "shell", &FrameRange::parse("1").unwrap())
    }

    fn allocation(id: i64, job_id: i64, tasks: &[i64]) -> (Allocation, Vec<Task>) {
        let allocation = Allocation {
            id,
            job_id,
            task_ids: tasks.to_vec(),
            computer: None,
            status: Status::Pending,
            info: None,
        };
        let tasks = tasks
            .iter()
            .map(|&t| Task {
                id: t,
                job_id,
                allocation_id: id,
                frame: t,
                status: Status::Pending,
                computer: None,
            })
            .collect();
        (allocation, tasks)
    }

    fn sample_tree() -> JobTree {
        let mut tree = JobTree::new();
        tree.upsert_job(job(1));
        tree.upsert_job(job(2));
        for (a, j, t) in [(10, 1, vec![100, 101]), (11, 1, vec![102]), (20, 2, vec![200])] {
            let (alloc, tasks) = allocation(a, j, &t);
            assert!(tree.attach_allocation(alloc, tasks));
        }
        tree
    }

    #[test]
    fn attach_links_children() {
        let tree = sample_tree();
        assert_eq!(tree.active_jobs(), 2);
        assert_eq!(tree.allocations_of(1), &[10, 11]);
        assert_eq!(tree.tasks_of(10), &[100, 101]);
        assert_eq!(tree.task(102).unwrap().allocation_id, 11);
    }

    #[test]
    fn attach_rejects_orphans_and_duplicates() {
        let mut tree = sample_tree();
        let (alloc, tasks) = allocation(10, 1, &[100]);
        assert!(!tree.attach_allocation(alloc, tasks));
        let (alloc, tasks) = allocation(99, 42, &[999]);
        assert!(!tree.attach_allocation(alloc, tasks));
        assert!(tree.task(999).is_none());
    }

    #[test]
    fn detach_task_reports_remaining_siblings() {
        let mut tree = sample_tree();
        let (_, remaining) = tree.detach_task(100).unwrap();
        assert_eq!(remaining, 1);
        let (_, remaining) = tree.detach_task(101).unwrap();
        assert_eq!(remaining, 0);
        assert!(tree.detach_task(101).is_none());
    }

    #[test]
    fn detach_allocation_drops_its_tasks() {
        let mut tree = sample_tree();
        let (alloc, remaining) = tree.detach_allocation(10).unwrap();
        assert_eq!(alloc.id, 10);
        assert_eq!(remaining, 1);
        assert!(tree.task(100).is_none());
        assert!(tree.task(101).is_none());
        assert_eq!(tree.task_count(), 2);
    }

    #[test]
    fn detach_job_drops_subtree_and_counter() {
        let mut tree = sample_tree();
        tree.detach_job(1).unwrap();
        assert_eq!(tree.active_jobs(), 1);
        assert_eq!(tree.job_ids(), &[2]);
        assert_eq!(tree.allocation_count(), 1);
        assert_eq!(tree.task_count(), 1);
    }

    #[test]
    fn upsert_existing_job_keeps_children_and_counter() {
        let mut tree = sample_tree();
        let mut updated = job(1);
        updated.status = Status::InProgress;
        tree.upsert_job(updated);
        assert_eq!(tree.active_jobs(), 2);
        assert_eq!(tree.job(1).unwrap().status, Status::InProgress);
        assert_eq!(tree.allocations_of(1), &[10, 11]);
    }

    #[test]
    fn picker_walks_job_major_and_restarts() {
        let tree = sample_tree();
        let mut picker = AllocationPicker::new();
        let mut pass = Vec::new();
        loop {
            match picker.next(&tree) {
                Pick::Candidate(id) => pass.push(id),
                Pick::EndOfPass => break,
            }
        }
        assert_eq!(pass, vec![10, 11, 20]);
        assert_eq!(picker.next(&tree), Pick::Candidate(10));
    }

    #[test]
    fn picker_tolerates_mutation_mid_pass() {
        let mut tree = sample_tree();
        let mut picker = AllocationPicker::new();
        assert_eq!(picker.next(&tree), Pick::Candidate(10));
        tree.detach_job(1);
        assert_eq!(picker.next(&tree), Pick::Candidate(20));
        assert_eq!(picker.next(&tree), Pick::EndOfPass);
        assert_eq!(picker.next(&tree), Pick::Candidate(20));
    }

    #[test]
    fn empty_tree_ends_pass_immediately() {
        let tree = JobTree::new();
        assert_eq!(AllocationPicker::new().next(&tree), Pick::EndOfPass);
    }
}
