pub mod containers;
pub mod doctor;
pub mod run;
pub mod status;
pub mod validate;
