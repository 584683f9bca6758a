/*
 * Named parameter storage.
 *
 * Every learned or tracked tensor of a model lives in a ParameterStore under
 * a '/'-separated name. Layers ask for their variables through a
 * VariableScope once, at build time, and keep the returned VarId handles.
 * Each recurrent step then reads (and for batch norm, updates) the store
 * through those handles, so one parameter set is shared by every time step.
 */

use crate::error::{ModelError, Result};
use crate::initializers::Initializer;
use crate::matrix::Matrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rcmaes::Vectorizable;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Handle to a variable inside a `ParameterStore`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarId(usize);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    name: String,
    shape: Vec<usize>,
    data: Vec<f64>,
    trainable: bool,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }
}

/// What a scope does when asked for a variable.
///
/// * `Create` fails if the name is already taken.
/// * `Reuse` fails if the name is missing.
/// * `Auto` creates missing variables and returns existing ones.
/// * `Inherit` takes the policy of the enclosing scope (`Create` at the root).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reuse {
    Inherit,
    Create,
    Reuse,
    Auto,
}

impl Default for Reuse {
    fn default() -> Self {
        Reuse::Inherit
    }
}

fn fresh_rng() -> StdRng {
    StdRng::from_os_rng()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterStore {
    variables: Vec<Variable>,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterStore {
    pub fn new() -> Self {
        ParameterStore {
            variables: vec![],
            rng: fresh_rng(),
        }
    }

    /// Store whose initializers and dropout masks are reproducible.
    pub fn seeded(seed: u64) -> Self {
        ParameterStore {
            variables: vec![],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn root_scope(&mut self) -> VariableScope<'_> {
        VariableScope {
            store: self,
            prefix: String::new(),
            reuse: Reuse::Create,
        }
    }

    /// Shorthand for a named scope directly below the root.
    pub fn scope(&mut self, name: &str, reuse: Reuse) -> VariableScope<'_> {
        let resolved = match reuse {
            Reuse::Inherit => Reuse::Create,
            other => other,
        };
        VariableScope {
            store: self,
            prefix: name.to_string(),
            reuse: resolved,
        }
    }

    pub fn find(&self, name: &str) -> Option<VarId> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .map(VarId)
    }

    pub fn variable(&self, id: VarId) -> Result<&Variable> {
        self.variables
            .get(id.0)
            .ok_or(ModelError::UnknownVariable { index: id.0 })
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn value(&self, id: VarId) -> Result<&[f64]> {
        Ok(&self.variable(id)?.data)
    }

    pub fn value_mut(&mut self, id: VarId) -> Result<&mut [f64]> {
        match self.variables.get_mut(id.0) {
            Some(var) => Ok(&mut var.data),
            None => Err(ModelError::UnknownVariable { index: id.0 }),
        }
    }

    /// Copies a rank-1 or rank-2 variable out as a matrix. Vectors come out
    /// as a single row.
    pub fn matrix(&self, id: VarId) -> Result<Matrix> {
        let var = self.variable(id)?;
        match var.shape.len() {
            1 => Matrix::from_vec(1, var.shape[0], var.data.clone()),
            2 => Matrix::from_vec(var.shape[0], var.shape[1], var.data.clone()),
            _ => Err(ModelError::shape(
                &format!("variable '{}' as matrix", var.name),
                &[0, 0],
                &var.shape,
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.variables
            .iter()
            .filter(|v| v.trainable)
            .map(|v| v.data.len())
            .sum()
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    fn create<I: Initializer>(
        &mut self,
        name: String,
        shape: &[usize],
        initializer: &I,
        trainable: bool,
    ) -> Result<VarId> {
        let data = initializer.initialize(shape, &mut self.rng)?;
        if data.len() != shape.iter().product::<usize>() {
            return Err(ModelError::VariableShapeMismatch {
                name,
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }
        debug!(name = %name, shape = ?shape, trainable, "created variable");
        self.variables.push(Variable {
            name,
            shape: shape.to_vec(),
            data,
            trainable,
        });
        Ok(VarId(self.variables.len() - 1))
    }
}

/// A name prefix plus a reuse policy over a borrowed store.
pub struct VariableScope<'a> {
    store: &'a mut ParameterStore,
    prefix: String,
    reuse: Reuse,
}

impl<'a> VariableScope<'a> {
    pub fn name(&self) -> &str {
        &self.prefix
    }

    pub fn reuse(&self) -> Reuse {
        self.reuse
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    pub fn sub_scope(&mut self, name: &str, reuse: Reuse) -> VariableScope<'_> {
        let prefix = self.qualify(name);
        let reuse = match reuse {
            Reuse::Inherit => self.reuse,
            other => other,
        };
        VariableScope {
            store: &mut *self.store,
            prefix,
            reuse,
        }
    }

    pub fn get_variable<I: Initializer>(
        &mut self,
        name: &str,
        shape: &[usize],
        initializer: I,
        trainable: bool,
    ) -> Result<VarId> {
        let full_name = self.qualify(name);
        match (self.store.find(&full_name), self.reuse) {
            (Some(_), Reuse::Create) | (Some(_), Reuse::Inherit) => {
                Err(ModelError::VariableExists { name: full_name })
            }
            (Some(id), _) => {
                let existing = self.store.variable(id)?;
                if existing.shape != shape {
                    return Err(ModelError::VariableShapeMismatch {
                        name: full_name,
                        expected: shape.to_vec(),
                        actual: existing.shape.clone(),
                    });
                }
                debug!(name = %full_name, "reusing variable");
                Ok(id)
            }
            (None, Reuse::Reuse) => Err(ModelError::VariableNotFound { name: full_name }),
            (None, _) => self
                .store
                .create(full_name, shape, &initializer, trainable),
        }
    }

    pub fn store(&mut self) -> &mut ParameterStore {
        &mut *self.store
    }
}

// Trainable values flattened in creation order. Everything else (running
// statistics, frozen tables) rides along in the context.
impl Vectorizable for ParameterStore {
    type Context = ParameterStore;

    fn to_vec(&self) -> (Vec<f64>, Self::Context) {
        let mut out = Vec::with_capacity(self.num_trainable_parameters());
        for v in self.variables.iter().filter(|v| v.trainable) {
            out.extend_from_slice(&v.data);
        }
        (out, self.clone())
    }

    fn from_vec(vec: &[f64], ctx: &Self::Context) -> Self {
        let mut store = ctx.clone();
        let mut cursor = 0;
        for v in store.variables.iter_mut().filter(|v| v.trainable) {
            let len = v.data.len();
            v.data.copy_from_slice(&vec[cursor..cursor + len]);
            cursor += len;
        }
        assert_eq!(cursor, vec.len());
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializers::{Constant, Zeros};

    #[test]
    fn create_then_conflict() {
        let mut store = ParameterStore::seeded(0);
        let mut scope = store.scope("cell", Reuse::Inherit);
        let id = scope.get_variable("w", &[2, 3], Zeros, true).unwrap();
        assert_eq!(store.variable(id).unwrap().name(), "cell/w");

        let mut scope = store.scope("cell", Reuse::Create);
        assert!(matches!(
            scope.get_variable("w", &[2, 3], Zeros, true),
            Err(ModelError::VariableExists { .. })
        ));
    }

    #[test]
    fn reuse_requires_existing_variable() {
        let mut store = ParameterStore::seeded(0);
        let mut scope = store.scope("cell", Reuse::Reuse);
        assert!(matches!(
            scope.get_variable("w", &[2], Zeros, true),
            Err(ModelError::VariableNotFound { .. })
        ));
    }

    #[test]
    fn reuse_returns_same_handle_and_checks_shape() {
        let mut store = ParameterStore::seeded(0);
        let first = store
            .scope("a", Reuse::Create)
            .get_variable("b", &[4], Constant(0.5), true)
            .unwrap();
        let again = store
            .scope("a", Reuse::Reuse)
            .get_variable("b", &[4], Zeros, true)
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(store.value(again).unwrap(), &[0.5; 4]);
        assert!(matches!(
            store
                .scope("a", Reuse::Auto)
                .get_variable("b", &[5], Zeros, true),
            Err(ModelError::VariableShapeMismatch { .. })
        ));
    }

    #[test]
    fn sub_scopes_inherit_policy() {
        let mut store = ParameterStore::seeded(0);
        store
            .scope("outer", Reuse::Create)
            .sub_scope("inner", Reuse::Inherit)
            .get_variable("v", &[1], Zeros, false)
            .unwrap();
        assert!(store.find("outer/inner/v").is_some());

        let mut outer = store.scope("outer", Reuse::Reuse);
        let inner = outer.sub_scope("inner", Reuse::Inherit);
        assert_eq!(inner.reuse(), Reuse::Reuse);
    }

    #[test]
    fn foreign_handles_are_reported() {
        let mut store = ParameterStore::seeded(0);
        let id = store
            .root_scope()
            .get_variable("w", &[2], Zeros, true)
            .unwrap();
        let mut other = ParameterStore::seeded(0);
        assert!(matches!(
            other.value(id),
            Err(ModelError::UnknownVariable { index: 0 })
        ));
        assert!(other.value_mut(id).is_err());
        assert!(other.matrix(id).is_err());
        assert!(store.matrix(id).is_ok());
    }

    #[test]
    fn vectorizable_skips_non_trainable() {
        let mut store = ParameterStore::seeded(0);
        {
            let mut scope = store.root_scope();
            scope.get_variable("w", &[2], Constant(1.0), true).unwrap();
            scope.get_variable("pop", &[3], Constant(7.0), false).unwrap();
            scope.get_variable("b", &[1], Constant(2.0), true).unwrap();
        }
        let (vec, ctx) = store.to_vec();
        assert_eq!(vec, vec![1.0, 1.0, 2.0]);

        let rebuilt = ParameterStore::from_vec(&[5.0, 6.0, 7.0], &ctx);
        assert_eq!(rebuilt.value(VarId(0)).unwrap(), &[5.0, 6.0]);
        assert_eq!(rebuilt.value(VarId(1)).unwrap(), &[7.0, 7.0, 7.0]);
        assert_eq!(rebuilt.value(VarId(2)).unwrap(), &[7.0]);
    }

    #[test]
    fn store_serializes_to_json() {
        let mut store = ParameterStore::seeded(1);
        store
            .root_scope()
            .get_variable("x", &[2], Constant(3.0), true)
            .unwrap();
        let json = serde_json::to_string(&store).unwrap();
        let back: ParameterStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back.variables(), store.variables());
    }
}
