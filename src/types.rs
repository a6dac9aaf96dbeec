use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ReportSpec defines the desired state of Report
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "gazosancontroller.k8s.io",
    version = "v1alpha1",
    kind = "Report",
    namespaced
)]
pub struct ReportSpec {
    /// URL of the site the report treats as the baseline.
    #[serde(rename = "BaseURL")]
    pub base_url: String,

    /// URL of the site compared against the baseline.
    #[serde(rename = "CompareURL")]
    pub compare_url: String,
}
