mod integration;
mod languages;
mod utils;
