mod bootstrap;
mod common;
mod lifecycle;
mod transfer;
