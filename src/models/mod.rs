pub mod base_model;
pub mod gbrt;
pub mod iforest;
pub mod tree_shap;
