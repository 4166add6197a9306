pub mod bean;
