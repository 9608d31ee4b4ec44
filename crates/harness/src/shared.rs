use std::path::PathBuf;

use studyplan_storage::{SqliteStore, StorageError, StoreConfig};
use tempfile::TempDir;

use crate::TestPlanner;

/// One database file on disk opened by several independent planners, each
/// with its own connection.
pub struct SharedDatabase {
    dir: TempDir,
    planners: Vec<TestPlanner>,
}

impl SharedDatabase {
    pub fn new() -> Result<Self, std::io::Error> {
        Ok(Self {
            dir: tempfile::tempdir()?,
            planners: Vec::new(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("studyplan.db")
    }

    pub fn open(&mut self) -> Result<usize, StorageError> {
        let store = SqliteStore::open_with_config(&StoreConfig::at(self.path()))?;
        let index = self.planners.len();
        self.planners.push(TestPlanner::over(store));
        Ok(index)
    }

    pub fn planner(&self, index: usize) -> &TestPlanner {
        &self.planners[index]
    }

    pub fn planner_mut(&mut self, index: usize) -> &mut TestPlanner {
        &mut self.planners[index]
    }
}
