use std::sync::Arc;

use crate::arbiter::Arbiter;
use crate::proxy::ForwardingGate;

/// Application dependencies - Arc-wrapped services shared by the tasks
pub struct ApplicationServices {
    pub arbiter: Arc<Arbiter>,
    pub gate: Arc<ForwardingGate>,
}
