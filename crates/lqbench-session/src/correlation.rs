//! Correlation ids for outbound requests.
//!
//! Single-request stages use `<purpose>_<runId>`; burst writes use
//! `<purpose>_<suffix>_<runId>` with a random suffix. Every id embeds the
//! session's run id, and the generator remembers what it issued so a suffix
//! collision is re-rolled instead of reused.

use std::collections::HashSet;

use lqbench_core::ids::random_token;
use lqbench_core::{CorrelationId, RunId};

/// Purpose prefix for the sign-in request.
pub const SIGNIN_PURPOSE: &str = "signin_request_id";
/// Purpose prefix for the namespace/database selection request.
pub const USE_PURPOSE: &str = "use_req_id";
/// Purpose prefix for the live-subscription request.
pub const LIVE_QUERY_PURPOSE: &str = "live_query_request";
/// Purpose prefix for burst writes.
pub const WRITE_PURPOSE: &str = "create";

/// Length of the random suffix in burst ids.
pub const SUFFIX_LEN: usize = 8;

/// Issues session-unique correlation ids.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    run_id: RunId,
    issued: HashSet<CorrelationId>,
}

impl CorrelationIdGenerator {
    /// Create a generator bound to a run id.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            issued: HashSet::new(),
        }
    }

    /// Id for a request sent once per session: `<purpose>_<runId>`.
    pub fn fixed(&mut self, purpose: &str) -> CorrelationId {
        let id = CorrelationId::from(format!("{purpose}_{}", self.run_id));
        let _ = self.issued.insert(id.clone());
        id
    }

    /// Fresh id for a repeated request: `<purpose>_<suffix>_<runId>`.
    pub fn unique(&mut self, purpose: &str) -> CorrelationId {
        loop {
            let suffix = random_token(SUFFIX_LEN);
            let id = CorrelationId::from(format!("{purpose}_{suffix}_{}", self.run_id));
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> usize {
        self.issued.len()
    }
}
