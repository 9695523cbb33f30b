//! Per-version structural field mapping.
//!
//! A [`FieldMapper`] converts between exactly two schema versions. The
//! registry is keyed by `(from, to)`; a mapper registered for `a -> b` also
//! serves `b -> a` through [`FieldMapper::convert_from`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::MapperError;
use crate::object::Resource;

pub trait FieldMapper: Send + Sync {
    /// Map an object of the source version into the destination shape.
    fn convert_to(&self, object: &mut Resource) -> Result<(), MapperError>;
    /// Map an object of the destination version back into the source shape.
    fn convert_from(&self, object: &mut Resource) -> Result<(), MapperError>;
}

/// Leaves the object untouched; for version pairs whose schemas agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughMapper;

impl FieldMapper for PassthroughMapper {
    fn convert_to(&self, _object: &mut Resource) -> Result<(), MapperError> {
        Ok(())
    }

    fn convert_from(&self, _object: &mut Resource) -> Result<(), MapperError> {
        Ok(())
    }
}

type MapFn = Arc<dyn Fn(&mut Resource) -> Result<(), MapperError> + Send + Sync>;

/// Mapper built from a pair of closures.
#[derive(Clone)]
pub struct FnMapper {
    forward: MapFn,
    reverse: MapFn,
}

impl FnMapper {
    pub fn new<F, R>(forward: F, reverse: R) -> Self
    where
        F: Fn(&mut Resource) -> Result<(), MapperError> + Send + Sync + 'static,
        R: Fn(&mut Resource) -> Result<(), MapperError> + Send + Sync + 'static,
    {
        Self {
            forward: Arc::new(forward),
            reverse: Arc::new(reverse),
        }
    }
}

impl fmt::Debug for FnMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMapper").finish_non_exhaustive()
    }
}

impl FieldMapper for FnMapper {
    fn convert_to(&self, object: &mut Resource) -> Result<(), MapperError> {
        (self.forward)(object)
    }

    fn convert_from(&self, object: &mut Resource) -> Result<(), MapperError> {
        (self.reverse)(object)
    }
}

/// Version-pair lookup for field mappers.
pub struct MapperRegistry {
    mappers: RwLock<BTreeMap<(String, String), Arc<dyn FieldMapper>>>,
    fallback: Option<Arc<dyn FieldMapper>>,
}

impl MapperRegistry {
    /// Registry that fails with [`MapperError::NoMapper`] for unknown pairs.
    pub fn new() -> Self {
        Self {
            mappers: RwLock::new(BTreeMap::new()),
            fallback: None,
        }
    }

    /// Registry that treats unknown pairs as structurally identical.
    pub fn with_passthrough() -> Self {
        Self {
            mappers: RwLock::new(BTreeMap::new()),
            fallback: Some(Arc::new(PassthroughMapper)),
        }
    }

    pub fn register(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        mapper: Arc<dyn FieldMapper>,
    ) -> Result<(), MapperError> {
        self.mappers
            .write()
            .map_err(|_| MapperError::Mapping("poisoned lock".into()))?
            .insert((from.into(), to.into()), mapper);
        Ok(())
    }

    pub fn has_mapper(&self, from: &str, to: &str) -> bool {
        self.lookup(from, to).is_some()
    }

    /// Run the mapper for `from -> to` against `object` in place.
    pub fn map(&self, object: &mut Resource, from: &str, to: &str) -> Result<(), MapperError> {
        if from == to {
            return Ok(());
        }
        match self.lookup(from, to) {
            Some((mapper, Direction::Forward)) => mapper.convert_to(object),
            Some((mapper, Direction::Reverse)) => mapper.convert_from(object),
            None => match &self.fallback {
                Some(fallback) => fallback.convert_to(object),
                None => Err(MapperError::NoMapper {
                    from: from.to_string(),
                    to: to.to_string(),
                }),
            },
        }
    }

    fn lookup(&self, from: &str, to: &str) -> Option<(Arc<dyn FieldMapper>, Direction)> {
        let guard = self.mappers.read().ok()?;
        if let Some(mapper) = guard.get(&(from.to_string(), to.to_string())) {
            return Some((Arc::clone(mapper), Direction::Forward));
        }
        guard
            .get(&(to.to_string(), from.to_string()))
            .map(|mapper| (Arc::clone(mapper), Direction::Reverse))
    }
}

impl fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<(String, String)> = self
            .mappers
            .read()
            .map(|guard| guard.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("MapperRegistry")
            .field("pairs", &pairs)
            .field("passthrough", &self.fallback.is_some())
            .finish()
    }
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}
