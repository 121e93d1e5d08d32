pub mod stress;
