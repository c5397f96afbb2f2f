mod correlation;
mod lifecycle;
mod queries;
