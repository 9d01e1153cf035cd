//! Attribute records: inline setter/getter closures with typed signatures.

use splash_core::{TypeCode, Value, Values};

/// Result of a [`set`](Attribute::set): callers distinguish an applied
/// change, an idempotent one, and a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeOutcome {
    Updated,
    NoChange,
    Rejected,
}

impl AttributeOutcome {
    pub fn is_ok(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Whether a set routed through a root may be deferred to the next task
/// drain or must run inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    Async,
    ForceSync,
}

type Setter = Box<dyn Fn(&Values) -> AttributeOutcome + Send + Sync>;
type Getter = Box<dyn Fn() -> Values + Send + Sync>;

/// One named attribute of a graph object.
///
/// The argument signature is a list of per-position type codes (`b`, `i`,
/// `r`, `s`, `v`, `t`); a set with mismatched arity or shapes is rejected
/// before the setter runs.
pub struct Attribute {
    setter: Option<Setter>,
    getter: Option<Getter>,
    arg_types: Vec<TypeCode>,
    doc: String,
    policy: SyncPolicy,
    locked: bool,
}

impl Attribute {
    pub fn new() -> Self {
        Self {
            setter: None,
            getter: None,
            arg_types: Vec::new(),
            doc: String::new(),
            policy: SyncPolicy::Async,
            locked: false,
        }
    }

    pub fn setter(mut self, setter: impl Fn(&Values) -> AttributeOutcome + Send + Sync + 'static) -> Self {
        self.setter = Some(Box::new(setter));
        self
    }

    pub fn getter(mut self, getter: impl Fn() -> Values + Send + Sync + 'static) -> Self {
        self.getter = Some(Box::new(getter));
        self
    }

    /// Expected argument shapes, one code per position.
    pub fn args(mut self, codes: &str) -> Self {
        self.arg_types = codes.bytes().collect();
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn force_sync(mut self) -> Self {
        self.policy = SyncPolicy::ForceSync;
        self
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn description(&self) -> &str {
        &self.doc
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn set(&self, args: &Values) -> AttributeOutcome {
        if self.locked {
            return AttributeOutcome::Rejected;
        }
        let Some(setter) = &self.setter else {
            return AttributeOutcome::Rejected;
        };
        if !self.check_args(args) {
            return AttributeOutcome::Rejected;
        }
        setter(args)
    }

    pub fn get(&self) -> Option<Values> {
        self.getter.as_ref().map(|getter| getter())
    }

    fn check_args(&self, args: &Values) -> bool {
        if self.arg_types.is_empty() {
            return true;
        }
        if args.len() < self.arg_types.len() {
            return false;
        }
        self.arg_types
            .iter()
            .zip(args.iter())
            .all(|(code, value)| argument_matches(*code, value))
    }
}

impl Default for Attribute {
    fn default() -> Self {
        Self::new()
    }
}

/// Numbers interconvert freely, so `i` and `r` accept any numeric or
/// boolean argument; everything accepts its own shape.
fn argument_matches(code: TypeCode, value: &Value) -> bool {
    use splash_core::ValueKind::{Boolean, Integer, Real, String as Str, Tuple, Values as Vals};
    match code {
        b'b' => matches!(value.kind(), Boolean | Integer | Real),
        b'i' | b'r' => matches!(value.kind(), Boolean | Integer | Real),
        b's' => matches!(value.kind(), Str),
        b'v' => matches!(value.kind(), Vals),
        b't' => matches!(value.kind(), Tuple),
        _ => true,
    }
}
