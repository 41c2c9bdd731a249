// Copyright 2025 The fabr contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Task values and the registry the CLI driver executes from.
//!
//! A task is a named async body invoked once per target host, with optional
//! host/role/parallelism metadata. How tasks come into existence (module
//! walking, codegen, hand registration) is the embedding binary's concern;
//! the engine only consumes a [`TaskRegistry`].

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::ops::TaskContext;

/// The async body of a task, run once per host.
pub type TaskBody =
    Arc<dyn for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// A named task with execution metadata.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub doc: Option<String>,
    pub hosts: Vec<String>,
    pub roles: Vec<String>,
    /// Some(true) forces parallel, Some(false) forces serial, None defers
    /// to `env.parallel`.
    pub parallel: Option<bool>,
    pub pool_size: Option<usize>,
    /// Marks the task run when the CLI is given no task names.
    pub default: bool,
    pub body: TaskBody,
    pub before: Option<TaskBody>,
    pub after: Option<TaskBody>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            doc: None,
            hosts: Vec::new(),
            roles: Vec::new(),
            parallel: None,
            pool_size: None,
            default: false,
            body: Arc::new(body),
            before: None,
            after: None,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = Some(true);
        self
    }

    pub fn serial(mut self) -> Self {
        self.parallel = Some(false);
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn with_before<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn with_after<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a mut TaskContext) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.after = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("hosts", &self.hosts)
            .field("roles", &self.roles)
            .field("parallel", &self.parallel)
            .field("pool_size", &self.pool_size)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

/// The set of tasks available to one CLI run, in registration order.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. A task re-registered under an existing name
    /// replaces the earlier one.
    pub fn register(&mut self, task: Task) -> &mut Self {
        if let Some(existing) = self.tasks.iter_mut().find(|t| t.name == task.name) {
            *existing = task;
        } else {
            self.tasks.push(task);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn default_task(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.default)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
