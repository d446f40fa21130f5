use super::{CacheBackend, CacheError, CacheKey, CacheKind, CacheMetadata, CachedResult};
use crate::warehouse::ResultSet;
use async_trait::async_trait;

/// Backend used when caching is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

#[async_trait]
impl CacheBackend for NullCache {
    fn kind(&self) -> CacheKind {
        CacheKind::None
    }

    async fn hit(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn fetch(&self, key: &CacheKey) -> Result<CachedResult, CacheError> {
        Err(CacheError::CacheMiss(key.clone()))
    }

    async fn store(
        &self,
        _key: &CacheKey,
        _payload: &ResultSet,
        _metadata: &CacheMetadata,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clear(&self, _key: &CacheKey) -> Result<bool, CacheError> {
        Ok(false)
    }

    async fn clear_all(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}
