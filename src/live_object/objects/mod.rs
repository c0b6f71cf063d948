//! Live objects bundled with the indexer.

pub mod pool;
pub mod project;

use super::error::ConfigError;
use super::registry::RegistryBuilder;

/// Register every bundled live object and its handlers with the registry.
pub fn register_all(builder: &mut RegistryBuilder) -> Result<(), ConfigError> {
    project::register(builder)?;
    pool::register(builder)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_object::registry::ChainRegistry;

    #[test]
    fn test_register_all_builds() {
        let mut builder = RegistryBuilder::new(ChainRegistry::new().with_chain("eth", "1"));
        register_all(&mut builder).unwrap();
        let registry = builder.build().unwrap();

        assert!(registry.entity(project::ENTITY).is_some());
        assert!(registry.entity(pool::ENTITY).is_some());
        assert!(registry.extended_groups().contains(pool::POOL_GROUP));
    }

    #[test]
    fn test_register_all_twice_is_rejected() {
        let mut builder = RegistryBuilder::new(ChainRegistry::new());
        register_all(&mut builder).unwrap();
        assert!(matches!(
            register_all(&mut builder),
            Err(ConfigError::DuplicateEntity(_))
        ));
    }
}
