#[path = "property/chain_linkage.rs"]
mod chain_linkage;

#[path = "property/signature_binding.rs"]
mod signature_binding;

#[path = "property/ceremony_paths.rs"]
mod ceremony_paths;
