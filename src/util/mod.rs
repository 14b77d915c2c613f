pub mod xdg;
