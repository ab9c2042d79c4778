use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

const APP_NAME: &str = "juju-app-name";
const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Labels applied to every resource the operator creates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(Map);

// === impl Labels ===

impl Labels {
    /// Labels resources as belonging to a Juju application.
    pub fn managed(app_name: &str) -> Self {
        Self(
            [
                (APP_NAME.to_string(), app_name.to_string()),
                (MANAGED_BY.to_string(), "juju".to_string()),
            ]
            .into_iter()
            .collect(),
        )
    }

    pub fn to_map(&self) -> Map {
        self.0.clone()
    }
}

impl AsRef<Map> for Labels {
    fn as_ref(&self) -> &Map {
        &self.0
    }
}
