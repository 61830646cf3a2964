//! Task Identity Planner.
//!
//! Sibling ids are derived from the control task's id alone, so a downstream
//! join step that only knows the width can rebuild the same list.

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};
use crate::runtime::identity::TaskIdentity;

const CONTROL_PREFIX: &str = "control-";

/// Control task id without its `control-` marker.
pub fn naming_root(control_task_id: &str) -> &str {
    control_task_id
        .strip_prefix(CONTROL_PREFIX)
        .unwrap_or(control_task_id)
}

/// Task id of the instance at `offset`. Offset 0 is the control task itself.
pub fn sibling_task_id(control_task_id: &str, offset: usize) -> String {
    if offset == 0 {
        control_task_id.to_string()
    } else {
        format!("{}-node-{}", naming_root(control_task_id), offset)
    }
}

/// Every task id a fan-out of `width` rooted at `control_task_id` produces,
/// in offset order.
pub fn expected_task_ids(control_task_id: &str, width: usize) -> Result<Vec<String>> {
    if width < 1 {
        return Err(CoordinatorError::InvalidFanout { width });
    }
    Ok((0..width)
        .map(|offset| sibling_task_id(control_task_id, offset))
        .collect())
}

/// Plans the roster for a fan-out of `width`.
pub fn plan(control: &TaskIdentity, width: usize) -> Result<JoinRoster> {
    let run_step = control.run_step();
    let entries = expected_task_ids(&control.task_id, width)?
        .into_iter()
        .enumerate()
        .map(|(offset, task_id)| TaskIdentity::new(&run_step, task_id, offset))
        .collect();
    Ok(JoinRoster { entries })
}

/// The identities a control instance joins on, in offset order.
/// Published once and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TaskIdentity>", into = "Vec<TaskIdentity>")]
pub struct JoinRoster {
    entries: Vec<TaskIdentity>,
}

impl TryFrom<Vec<TaskIdentity>> for JoinRoster {
    type Error = String;

    fn try_from(entries: Vec<TaskIdentity>) -> std::result::Result<Self, Self::Error> {
        if entries.is_empty() {
            return Err("a roster holds at least the control task".to_string());
        }
        Ok(Self { entries })
    }
}

impl From<JoinRoster> for Vec<TaskIdentity> {
    fn from(roster: JoinRoster) -> Self {
        roster.entries
    }
}

impl JoinRoster {
    pub fn control(&self) -> &TaskIdentity {
        &self.entries[0]
    }

    /// Every entry except the control task.
    pub fn siblings(&self) -> &[TaskIdentity] {
        &self.entries[1..]
    }

    pub fn width(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[TaskIdentity] {
        &self.entries
    }

    pub fn get(&self, offset: usize) -> Option<&TaskIdentity> {
        self.entries.get(offset)
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|t| t.task_id.as_str()).collect()
    }

    /// Roster entries missing from `observed`, in offset order.
    pub fn missing<'a, I>(&self, observed: I) -> Vec<TaskIdentity>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let observed: Vec<&str> = observed.into_iter().collect();
        self.entries
            .iter()
            .filter(|t| !observed.contains(&t.task_id.as_str()))
            .cloned()
            .collect()
    }
}
