use std::collections::HashMap;

/// Camera name to forum thread routing. Cameras without an entry post
/// to the chat root, thread 0.
#[derive(Debug, Clone, Default)]
pub struct ThreadRoutes {
    table: HashMap<String, i32>,
}

impl ThreadRoutes {
    pub fn new(table: HashMap<String, i32>) -> Self {
        Self { table }
    }

    pub fn thread_for(&self, camera: &str) -> i32 {
        self.table.get(camera).copied().unwrap_or(0)
    }
}
