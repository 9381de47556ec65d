mod crud;
mod support;
