//! Namespace and ingress-class scoping.

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use super::event::Payload;

/// Legacy annotation selecting an ingress controller.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Which objects the controller is responsible for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSettings {
    /// Namespaces to watch. Empty means all.
    pub namespaces: Vec<String>,
    /// Namespaces to skip even when included.
    pub ignore_namespaces: Vec<String>,
    /// Ingress class to serve. `None` serves every Ingress.
    pub ingress_class: Option<String>,
}

impl FilterSettings {
    pub fn admits_namespace(&self, namespace: &str) -> bool {
        if self.ignore_namespaces.iter().any(|ns| ns == namespace) {
            return false;
        }
        self.namespaces.is_empty() || self.namespaces.iter().any(|ns| ns == namespace)
    }

    /// Whether an Ingress carries the configured class.
    pub fn admits_class(&self, ingress: &Ingress) -> bool {
        let Some(wanted) = self.ingress_class.as_deref().filter(|c| !c.is_empty()) else {
            return true;
        };
        let class = ingress
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.as_deref())
            .or_else(|| {
                ingress
                    .annotations()
                    .get(INGRESS_CLASS_ANNOTATION)
                    .map(String::as_str)
            });
        class == Some(wanted)
    }

    /// Whether a watched object is in scope.
    pub fn admits(&self, payload: &Payload) -> bool {
        if !self.admits_namespace(&payload.key().namespace) {
            return false;
        }
        match payload {
            Payload::Ingress(ingress) => self.admits_class(ingress),
            _ => true,
        }
    }
}
