pub mod cli;
pub mod events;
pub mod io;
pub mod model;
pub mod store;
pub mod tags;
pub mod util;
