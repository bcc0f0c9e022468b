//! Per-request context: the request plus type-erased extensions.
//!
//! Middleware passes state down the chain through [`Extensions`]. The output
//! cache reads a per-request [`CachePolicy`](crate::cache::CachePolicy) override
//! from here.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;

/// Type-erased map keyed by type, one value per type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value`, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// A request travelling through the middleware chain.
#[derive(Debug)]
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self::from_parts(request, Extensions::new())
    }

    /// Reassembles a context split with [`into_parts`](Self::into_parts).
    pub fn from_parts(request: Request, extensions: Extensions) -> Self {
        Self { request, extensions }
    }

    pub fn into_parts(self) -> (Request, Extensions) {
        (self.request, self.extensions)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(Tenant("acme")).is_none());
        assert_eq!(ext.insert(Tenant("globex")), Some(Tenant("acme")));
        ext.insert(7u32);

        assert_eq!(ext.get::<Tenant>(), Some(&Tenant("globex")));
        *ext.get_mut::<u32>().unwrap() += 1;
        assert_eq!(ext.remove::<u32>(), Some(8));
        assert_eq!(ext.len(), 1);
    }

    #[test]
    fn parts_round_trip_keeps_extensions() {
        let mut ctx = Context::new(Request::new(Method::Get, "/a"));
        ctx.extensions_mut().insert(Tenant("acme"));
        let (request, extensions) = ctx.into_parts();
        let ctx = Context::from_parts(request, extensions);
        assert_eq!(ctx.request().path(), "/a");
        assert!(ctx.extensions().get::<Tenant>().is_some());
    }
}
