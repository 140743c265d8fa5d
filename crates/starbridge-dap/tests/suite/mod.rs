mod breakpoints;
mod inspection;
mod lifecycle;
