//! Request and response models of the dockhand control API

pub mod models;
