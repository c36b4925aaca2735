//! Dependency-injected replacement for the source's Redis-backed debug
//! singleton (`cyc_debug_interface.h`). The core only ever depends on this
//! trait; wiring an actual Redis client (or anything else) into it is the
//! application's problem, same as the teacher accepting collaborators
//! through a trait object rather than a module-level singleton.

/// Sink for ad hoc key/value debug state a running server wants to expose
/// externally (connection counts, per-worker load, last error, ...).
pub trait DebugInterface: Send + Sync {
    fn set_value_str(&self, key: &str, value: &str);
    fn set_value_i32(&self, key: &str, value: i32);
    fn del_value(&self, key: &str);
}

/// Default no-op implementation; used when a server/client is built without
/// an explicit `DebugInterface`.
#[derive(Default, Clone, Copy)]
pub struct NullDebugInterface;

impl DebugInterface for NullDebugInterface {
    fn set_value_str(&self, _key: &str, _value: &str) {}
    fn set_value_i32(&self, _key: &str, _value: i32) {}
    fn del_value(&self, _key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_debug_interface_is_inert() {
        let d = NullDebugInterface;
        d.set_value_str("k", "v");
        d.set_value_i32("k", 1);
        d.del_value("k");
    }
}
