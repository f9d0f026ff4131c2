pub mod dbstory;
