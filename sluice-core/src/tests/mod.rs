mod adapters;
mod cycle;
mod flush;
mod labels;
mod linear;
mod modules;
mod shared_tables;
