use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ExecError;
use crate::operator::Operator;

/// Operator descriptors keyed by operator type name.
///
/// Populated once at startup and then only read by the engine.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, operator: impl Operator + 'static) -> &mut Self {
        self.operators.insert(name.into(), Arc::new(operator));
        self
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Operator>, ExecError> {
        self.operators
            .get(name)
            .ok_or_else(|| ExecError::UnknownOperator(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{ExecOp, PrepareContext, SimpleExecOp};

    struct Noop;

    impl Operator for Noop {
        fn prepare(&self, _: &PrepareContext<'_>) -> anyhow::Result<Box<dyn ExecOp>> {
            Ok(Box::new(SimpleExecOp::new(|_| Ok(()))))
        }
    }

    #[test]
    fn test_lookup() {
        let mut registry = OperatorRegistry::new();
        registry.register("noop", Noop);

        assert!(registry.contains("noop"));
        assert!(registry.get("noop").unwrap().incremental().is_none());
        assert!(matches!(
            registry.get("resample"),
            Err(ExecError::UnknownOperator(name)) if name == "resample"
        ));
    }
}
