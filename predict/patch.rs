// ========================================================================================
//
//                       THE MODEL COMPATIBILITY PATCHER
//
// ========================================================================================
//
// ### Purpose ###
//
// Classifier artifacts outlive the library versions they were fitted under. When a
// library renames a fitted attribute, an old artifact still carries the legacy name
// while current prediction code reads the new one. This module walks an artifact's
// object graph and, for every node of a known type, adds the current attribute name
// as an alias of the legacy one.
//
// ### Guarantees ###
//
// 1.  Aliases only. The legacy attribute is never removed, because other code paths
//     may still read it. An existing current-style attribute is never overwritten.
// 2.  Idempotent. Running the patcher on an already-patched graph adds nothing.
// 3.  Cycle safe. Every node is visited at most once, keyed by identity.
// 4.  Silent on the unknown. Unrecognized node types are descended into but never
//     patched, and never cause an error.
//
// The traversal is written against `GraphNode`, not a concrete representation.

use ahash::AHashSet;

/// The view of an object graph the patcher needs. Implementations are expected to
/// use interior mutability: patching happens through shared handles.
pub trait GraphNode: Clone {
    /// Equal for two handles to the same node, distinct otherwise.
    fn identity(&self) -> usize;

    /// The node's type name, if it is a typed attribute container.
    fn type_name(&self) -> Option<String>;

    /// Nodes directly reachable from this one: mapping values, sequence and set
    /// elements, and attribute values.
    fn children(&self) -> Vec<Self>;

    fn has_attribute(&self, name: &str) -> bool;

    /// Makes `to` refer to the value of `from`. Returns `false` if nothing was added.
    fn alias_attribute(&self, from: &str, to: &str) -> bool;
}

/// One attribute rename between library versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeAlias {
    /// Matched against the last dotted segment of the node's type name.
    pub type_name: &'static str,
    pub legacy: &'static str,
    pub current: &'static str,
    /// The name of the fix this alias belongs to, as reported in the output.
    pub fix: &'static str,
}

/// Kernel PCA stored its eigen-decomposition as `alphas_`/`lambdas_` in scikit-learn
/// 0.22 and earlier, and as `eigenvectors_`/`eigenvalues_` from 1.0 on.
pub const KERNEL_PCA_FIX: &str = "kernelpca_old_pickle_attributes";

pub const COMPATIBILITY_PATCHES: &[AttributeAlias] = &[
    AttributeAlias {
        type_name: "KernelPCA",
        legacy: "alphas_",
        current: "eigenvectors_",
        fix: KERNEL_PCA_FIX,
    },
    AttributeAlias {
        type_name: "KernelPCA",
        legacy: "lambdas_",
        current: "eigenvalues_",
        fix: KERNEL_PCA_FIX,
    },
];

/// What a patching pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub nodes_visited: usize,
    pub aliases_added: usize,
}

/// Applies the built-in alias table to everything reachable from `root`.
pub fn apply_compatibility_patches<N: GraphNode>(root: &N) -> PatchReport {
    apply_patches(root, COMPATIBILITY_PATCHES)
}

/// Applies an arbitrary alias table to everything reachable from `root`.
pub fn apply_patches<N: GraphNode>(root: &N, table: &[AttributeAlias]) -> PatchReport {
    let mut report = PatchReport::default();
    let mut visited: AHashSet<usize> = AHashSet::new();
    let mut worklist = vec![root.clone()];

    while let Some(node) = worklist.pop() {
        if !visited.insert(node.identity()) {
            continue;
        }
        report.nodes_visited += 1;

        if let Some(type_name) = node.type_name() {
            let short_name = type_name.rsplit('.').next().unwrap_or(&type_name);
            for alias in table.iter().filter(|a| a.type_name == short_name) {
                if node.has_attribute(alias.legacy)
                    && !node.has_attribute(alias.current)
                    && node.alias_attribute(alias.legacy, alias.current)
                {
                    log::debug!(
                        "Aliased {}.{} as {} ({})",
                        type_name,
                        alias.legacy,
                        alias.current,
                        alias.fix
                    );
                    report.aliases_added += 1;
                }
            }
        }

        worklist.extend(node.children());
    }

    log::info!(
        "Compatibility pass visited {} objects and added {} attribute aliases.",
        report.nodes_visited,
        report.aliases_added
    );
    report
}

/// The distinct fix names in a table, in table order.
pub fn fix_names(table: &[AttributeAlias]) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    for alias in table {
        if !names.contains(&alias.fix) {
            names.push(alias.fix);
        }
    }
    names
}
