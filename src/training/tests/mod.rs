//! Trainer tests on small in-memory datasets


mod checkpoint_tests;
mod trainer_tests;
