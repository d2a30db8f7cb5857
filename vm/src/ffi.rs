//! Foreign-function bindings.
//!
//! A registry of name → (arity, native callback) pairs is supplied at VM
//! construction. Callbacks receive positional numeric arguments and
//! return a single numeric result; they are invoked directly by the
//! interpreter with values read from the callee frame region.

use std::rc::Rc;

pub type ForeignFn = Rc<dyn Fn(&[f64]) -> f64>;

#[derive(Clone)]
pub struct ForeignFunction {
    pub parameter_count: u16,
    pub callback: ForeignFn,
}

/// Name-keyed registry of foreign bindings, in registration order.
#[derive(Default, Clone)]
pub struct ForeignRegistry {
    entries: Vec<(String, ForeignFunction)>,
}

impl ForeignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        parameter_count: u16,
        callback: impl Fn(&[f64]) -> f64 + 'static,
    ) {
        self.entries.push((
            name.into(),
            ForeignFunction {
                parameter_count,
                callback: Rc::new(callback),
            },
        ));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ForeignFunction)> {
        self.entries.iter().map(|(n, f)| (n.as_str(), f))
    }
}
