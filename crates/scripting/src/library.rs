//! Named-function catalog for FCALL-style invocation.
//!
//! Kept to its registry interaction: a name → compiled-function mapping
//! admitted through FUNCTION LOAD and consumed by FCALL. Persistence and
//! ACL handling live outside the scripting core.

use std::collections::HashMap;

use crate::engine::CompiledFunction;
use crate::error::{ScriptingError, ScriptingResult};

/// One loaded library function.
pub struct LibraryFunction {
    engine: String,
    function: CompiledFunction,
}

impl LibraryFunction {
    /// Name of the engine owning the compiled form.
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// The compiled function.
    pub fn function(&self) -> &CompiledFunction {
        &self.function
    }
}

/// The function catalog.
#[derive(Default)]
pub struct FunctionLibrary {
    functions: HashMap<String, LibraryFunction>,
}

impl FunctionLibrary {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loaded functions.
    pub fn count(&self) -> usize {
        self.functions.len()
    }

    /// Looks up a function by name.
    pub fn get(&self, name: &str) -> Option<&LibraryFunction> {
        self.functions.get(name)
    }

    /// Admits a batch of compiled functions produced by one FUNCTION LOAD.
    ///
    /// Every function must carry a name, the batch must not collide with
    /// itself or the catalog, and at least one function must be present.
    /// On failure the batch is returned so the caller can release it
    /// through the owning engine; the catalog is left unchanged.
    pub fn admit(
        &mut self,
        engine: &str,
        functions: Vec<CompiledFunction>,
    ) -> Result<Vec<String>, (ScriptingError, Vec<CompiledFunction>)> {
        if functions.is_empty() {
            return Err((ScriptingError::NoFunctionsRegistered, functions));
        }

        let mut names = Vec::with_capacity(functions.len());
        for function in &functions {
            let Some(name) = function.name.as_deref() else {
                return Err((
                    ScriptingError::invalid_arguments("Library functions must be named"),
                    functions,
                ));
            };
            if self.functions.contains_key(name) || names.iter().any(|n| n == name) {
                let name = name.to_string();
                return Err((ScriptingError::FunctionExists { name }, functions));
            }
            names.push(name.to_string());
        }

        for function in functions {
            let name = function
                .name
                .clone()
                .unwrap_or_else(|| unreachable!("validated above"));
            self.functions.insert(
                name,
                LibraryFunction {
                    engine: engine.to_string(),
                    function,
                },
            );
        }
        Ok(names)
    }

    /// Removes and returns every function owned by `engine`. Used when the
    /// engine is being unregistered; the caller releases the functions
    /// through the engine before dropping its descriptor.
    pub fn take_engine_functions(&mut self, engine: &str) -> Vec<CompiledFunction> {
        let names: Vec<String> = self
            .functions
            .iter()
            .filter(|(_, lf)| lf.engine == engine)
            .map(|(name, _)| name.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.functions.remove(&name))
            .map(|lf| lf.function)
            .collect()
    }

    /// Function names currently loaded, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Convenience alias used by dispatch results.
pub type AdmitResult = ScriptingResult<Vec<String>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::ScriptFlags;

    fn named(name: &str) -> CompiledFunction {
        CompiledFunction {
            name: Some(name.to_string()),
            description: None,
            payload: Box::new(()),
            flags: ScriptFlags::empty(),
        }
    }

    #[test]
    fn test_admit_and_lookup() {
        let mut library = FunctionLibrary::new();
        let names = library
            .admit("hello", vec![named("foo"), named("bar")])
            .unwrap();
        assert_eq!(names, vec!["foo", "bar"]);
        assert_eq!(library.count(), 2);
        assert_eq!(library.get("foo").unwrap().engine(), "hello");
    }

    #[test]
    fn test_empty_batch_rejected() {
        let mut library = FunctionLibrary::new();
        let (err, returned) = library.admit("hello", Vec::new()).unwrap_err();
        assert!(matches!(err, ScriptingError::NoFunctionsRegistered));
        assert!(returned.is_empty());
    }

    #[test]
    fn test_unnamed_function_rejected() {
        let mut library = FunctionLibrary::new();
        let anonymous = CompiledFunction {
            name: None,
            description: None,
            payload: Box::new(()),
            flags: ScriptFlags::empty(),
        };
        let (err, returned) = library.admit("hello", vec![anonymous]).unwrap_err();
        assert!(matches!(err, ScriptingError::InvalidArguments { .. }));
        assert_eq!(returned.len(), 1);
        assert_eq!(library.count(), 0);
    }

    #[test]
    fn test_name_collision_leaves_catalog_unchanged() {
        let mut library = FunctionLibrary::new();
        library.admit("hello", vec![named("foo")]).unwrap();
        let (err, returned) = library
            .admit("hello", vec![named("bar"), named("foo")])
            .unwrap_err();
        assert!(matches!(err, ScriptingError::FunctionExists { .. }));
        assert_eq!(returned.len(), 2);
        assert_eq!(library.count(), 1);
    }

    #[test]
    fn test_take_engine_functions() {
        let mut library = FunctionLibrary::new();
        library.admit("hello", vec![named("foo")]).unwrap();
        library.admit("rhai", vec![named("baz")]).unwrap();

        let taken = library.take_engine_functions("hello");
        assert_eq!(taken.len(), 1);
        assert_eq!(library.count(), 1);
        assert!(library.get("baz").is_some());
    }
}
