//! Composition operators
//!
//! - `a | b` pipes `a`'s stdout into `b`
//! - `a | "path"` writes stdout to a file; `"path" | a` reads stdin from one
//! - `a | Redirect::..` / `a | RedirectSet` wraps `a` with redirects
//! - `vec![..] | a` feeds the items as lines
//! - `a + b` runs both side by side

use std::ops::Add;
use std::ops::BitOr;
use std::path::PathBuf;

use super::Command;
use super::Function;
use super::Pipeline;
use crate::plumbing::Redirect;
use crate::plumbing::RedirectSet;

macro_rules! impl_node_ops {
    ($lhs:ty => $($rhs:ty),*) => {
        $(
            impl BitOr<$rhs> for $lhs {
                type Output = Pipeline;

                fn bitor(self, rhs: $rhs) -> Pipeline {
                    Pipeline::from(self).pipe(rhs)
                }
            }

            impl Add<$rhs> for $lhs {
                type Output = Pipeline;

                fn add(self, rhs: $rhs) -> Pipeline {
                    Pipeline::from(self).group(rhs)
                }
            }
        )*

        impl BitOr<&str> for $lhs {
            type Output = Pipeline;

            fn bitor(self, path: &str) -> Pipeline {
                Pipeline::from(self).stdout_to(path)
            }
        }

        impl BitOr<PathBuf> for $lhs {
            type Output = Pipeline;

            fn bitor(self, path: PathBuf) -> Pipeline {
                Pipeline::from(self).stdout_to(path)
            }
        }

        impl BitOr<Redirect> for $lhs {
            type Output = Pipeline;

            fn bitor(self, redirect: Redirect) -> Pipeline {
                Pipeline::from(self).redirect(redirect)
            }
        }

        impl BitOr<RedirectSet> for $lhs {
            type Output = Pipeline;

            fn bitor(self, redirects: RedirectSet) -> Pipeline {
                Pipeline::from(self).redirect(redirects)
            }
        }

        impl BitOr<$lhs> for &str {
            type Output = Pipeline;

            fn bitor(self, node: $lhs) -> Pipeline {
                Pipeline::from(node).stdin_from(self)
            }
        }

        impl BitOr<$lhs> for Vec<String> {
            type Output = Pipeline;

            fn bitor(self, node: $lhs) -> Pipeline {
                Pipeline::from(Function::lines(self)).pipe(node)
            }
        }

        impl BitOr<$lhs> for Vec<&'static str> {
            type Output = Pipeline;

            fn bitor(self, node: $lhs) -> Pipeline {
                Pipeline::from(Function::lines(self)).pipe(node)
            }
        }
    };
}

impl_node_ops!(Pipeline => Pipeline, Command, Function);
impl_node_ops!(Command => Pipeline, Command, Function);
impl_node_ops!(Function => Pipeline, Command, Function);
