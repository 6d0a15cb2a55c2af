use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::types::OrchestratorError;
use crate::services::gateway::RouteOptions;
use crate::services::microservice::Microservice;
use crate::services::runtime::Runtime;

/// 在共享运行时上构造服务实例
pub type ServiceFactory = Arc<dyn Fn(Runtime) -> Arc<Microservice> + Send + Sync>;

/// 服务启动后注册到网关的路由
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub pattern: String,
    pub options: RouteOptions,
}

/// 编排器管理的一个服务：名称、依赖、路由和构造函数
#[derive(Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub depends_on: Vec<String>,
    pub routes: Vec<RouteSpec>,
    pub factory: ServiceFactory,
}

impl fmt::Debug for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSpec")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("routes", &self.routes)
            .finish()
    }
}

impl ServiceSpec {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Runtime) -> Arc<Microservice> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            routes: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        self.depends_on.push(service.into());
        self
    }

    pub fn route(mut self, pattern: impl Into<String>, options: RouteOptions) -> Self {
        self.routes.push(RouteSpec {
            pattern: pattern.into(),
            options,
        });
        self
    }
}

/// 按依赖关系排序，互不依赖的服务保持声明顺序，返回下标
pub fn resolve_start_order(specs: &[ServiceSpec]) -> Result<Vec<usize>, OrchestratorError> {
    let mut declared = HashSet::with_capacity(specs.len());
    for spec in specs {
        if !declared.insert(spec.name.as_str()) {
            return Err(OrchestratorError::DuplicateService(spec.name.clone()));
        }
    }
    for spec in specs {
        if let Some(missing) = spec
            .depends_on
            .iter()
            .find(|dependency| !declared.contains(dependency.as_str()))
        {
            return Err(OrchestratorError::UnknownDependency {
                service: spec.name.clone(),
                dependency: missing.clone(),
            });
        }
    }

    let mut placed = vec![false; specs.len()];
    let mut started: HashSet<&str> = HashSet::with_capacity(specs.len());
    let mut order = Vec::with_capacity(specs.len());
    while order.len() < specs.len() {
        let ready = specs.iter().enumerate().find(|(index, spec)| {
            !placed[*index]
                && spec
                    .depends_on
                    .iter()
                    .all(|dependency| started.contains(dependency.as_str()))
        });
        let Some((index, spec)) = ready else {
            let remaining = specs
                .iter()
                .enumerate()
                .filter(|(index, _)| !placed[*index])
                .map(|(_, spec)| spec.name.clone())
                .collect();
            return Err(OrchestratorError::DependencyCycle(remaining));
        };
        placed[index] = true;
        started.insert(spec.name.as_str());
        order.push(index);
    }
    Ok(order)
}
