mod lock;
mod scheduler;
