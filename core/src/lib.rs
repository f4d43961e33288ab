pub mod cloud;
pub mod db;
pub mod decay;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod service;
pub mod sync;
pub mod timeline;
