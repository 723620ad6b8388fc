pub mod taskd;
