use std::sync::Arc;

use parley_gateway::{Gateway, IdentityVerifier};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
    pub verifier: Arc<dyn IdentityVerifier>,
}
