//! The service registry: a tree of groups, each owning service bindings and
//! a middleware list.
// (c) 2025 Ross Younger

use std::collections::HashMap;
use std::sync::Arc;

use crate::middleware::Middleware;
use crate::protocol::{Context, Reader};
use crate::stream::{Stream, StreamHandler};
use crate::{Error, Result};

/// Handles one unary request: deserializes the method ID and request
/// composite from `reader`, runs the middleware stack around the user
/// method, and returns a complete response frame. Generated code provides
/// these.
pub type ServiceHandler =
    Arc<dyn Fn(Context, &[Middleware], u64, Reader) -> Vec<u8> + Send + Sync>;

/// Handles a stream-open request: deserializes the method ID and open
/// composite from `reader` and returns the handler that will answer
/// messages on the new stream. Generated code provides these.
pub type StreamOpenHandler =
    Arc<dyn Fn(&Context, &Arc<Stream>, &mut Reader) -> Result<Arc<dyn StreamHandler>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum RegisteredService {
    Unary(ServiceHandler),
    StreamOpen(StreamOpenHandler),
}

struct Group {
    parent: Option<usize>,
    middleware: Vec<Middleware>,
    services: HashMap<u64, RegisteredService>,
}

/// Group tree plus the service-ID index. Groups are arena-allocated and
/// identified by index; the active stack tracks `Server::group` nesting.
pub(crate) struct ServiceRegistry {
    groups: Vec<Group>,
    active: Vec<usize>,
    owner_by_service: HashMap<u64, usize>,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            groups: vec![Group {
                parent: None,
                middleware: Vec::new(),
                services: HashMap::new(),
            }],
            active: vec![0],
            owner_by_service: HashMap::new(),
        }
    }

    fn active_group(&self) -> usize {
        *self.active.last().unwrap_or(&0)
    }

    pub(crate) fn register(&mut self, service_id: u64, service: RegisteredService) -> Result<()> {
        if self.owner_by_service.contains_key(&service_id) {
            return Err(Error::DuplicateService(service_id));
        }
        let group = self.active_group();
        let _ = self.groups[group].services.insert(service_id, service);
        let _ = self.owner_by_service.insert(service_id, group);
        Ok(())
    }

    pub(crate) fn add_middleware(&mut self, middleware: Middleware) {
        let group = self.active_group();
        self.groups[group].middleware.push(middleware);
    }

    pub(crate) fn enter_group(&mut self) {
        let parent = self.active_group();
        self.groups.push(Group {
            parent: Some(parent),
            middleware: Vec::new(),
            services: HashMap::new(),
        });
        self.active.push(self.groups.len() - 1);
    }

    pub(crate) fn exit_group(&mut self) {
        if self.active.len() > 1 {
            let _ = self.active.pop();
        }
    }

    /// The handler for `service_id` plus its effective middleware stack:
    /// the concatenation from the root group down to the owning group,
    /// root outermost.
    pub(crate) fn lookup(
        &self,
        service_id: u64,
    ) -> Option<(RegisteredService, Vec<Middleware>)> {
        let owner = *self.owner_by_service.get(&service_id)?;
        let service = self.groups[owner].services.get(&service_id)?.clone();

        let mut chain = Vec::new();
        let mut group = Some(owner);
        while let Some(idx) = group {
            chain.push(idx);
            group = self.groups[idx].parent;
        }
        let middleware = chain
            .iter()
            .rev()
            .flat_map(|idx| self.groups[*idx].middleware.iter().cloned())
            .collect();
        Some((service, middleware))
    }
}

#[cfg(test)]
mod test {
    use super::{RegisteredService, ServiceRegistry};
    use crate::middleware::Middleware;
    use crate::Error;
    use std::sync::Arc;

    fn nop_service() -> RegisteredService {
        RegisteredService::Unary(Arc::new(|_, _, _, _| Vec::new()))
    }

    fn nop_middleware() -> Middleware {
        Arc::new(
            |ctx: &mut crate::protocol::Context,
             req: &dyn crate::protocol::Message,
             next: &crate::middleware::Next| next(ctx, req),
        )
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut reg = ServiceRegistry::new();
        reg.register(1, nop_service()).unwrap();
        assert_eq!(
            reg.register(1, nop_service()).unwrap_err(),
            Error::DuplicateService(1)
        );
    }

    #[test]
    fn middleware_stacks_root_to_leaf() {
        let mut reg = ServiceRegistry::new();
        reg.add_middleware(nop_middleware()); // root
        reg.enter_group();
        reg.add_middleware(nop_middleware()); // child
        reg.add_middleware(nop_middleware()); // child
        reg.register(7, nop_service()).unwrap();
        reg.exit_group();
        reg.register(8, nop_service()).unwrap();

        let (_, stack) = reg.lookup(7).unwrap();
        assert_eq!(stack.len(), 3);
        let (_, stack) = reg.lookup(8).unwrap();
        assert_eq!(stack.len(), 1);
        assert!(reg.lookup(9).is_none());
    }
}
