use std::collections::HashSet;

use anyhow::{ensure, Result};

use crate::tensor::Blob;

pub type VisitParamsFn<'a> = dyn FnMut(&str, &Blob) -> Result<()> + 'a;
pub type VisitParamsMutFn<'a> = dyn FnMut(&str, &mut Blob) -> Result<()> + 'a;

/// Anything owning learnable blobs addressed by name.
pub trait Module {
    fn visit_params(&self, f: &mut VisitParamsFn<'_>) -> Result<()>;

    fn visit_params_mut(&mut self, f: &mut VisitParamsMutFn<'_>) -> Result<()>;
}

pub fn check_param_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "parameter names must be non-empty");
    ensure!(
        !name.contains('.'),
        "parameter names must not contain '.', got '{name}'"
    );
    ensure!(
        name.is_ascii(),
        "parameter names must be ASCII, got '{name}'"
    );
    Ok(())
}

/// Names of every parameter of `module`, validated and checked for duplicates.
pub fn param_names(module: &dyn Module) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    module.visit_params(&mut |name, _| {
        check_param_name(name)?;
        ensure!(seen.insert(name.to_string()), "duplicate parameter '{name}'");
        names.push(name.to_string());
        Ok(())
    })?;
    Ok(names)
}

/// Total number of learnable values.
pub fn num_params(module: &dyn Module) -> Result<usize> {
    let mut total = 0;
    module.visit_params(&mut |_, blob| {
        total += blob.count();
        Ok(())
    })?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    struct Pair {
        a: Blob,
        b: Blob,
        b_name: &'static str,
    }

    impl Module for Pair {
        fn visit_params(&self, f: &mut VisitParamsFn<'_>) -> Result<()> {
            f("a", &self.a)?;
            f(self.b_name, &self.b)
        }

        fn visit_params_mut(&mut self, f: &mut VisitParamsMutFn<'_>) -> Result<()> {
            f("a", &mut self.a)?;
            f(self.b_name, &mut self.b)
        }
    }

    fn pair(b_name: &'static str) -> Pair {
        Pair {
            a: Blob::zeros(Shape::new([2, 3])),
            b: Blob::zeros(Shape::new([4])),
            b_name,
        }
    }

    #[test]
    fn names_and_counts_are_collected() {
        let module = pair("b");
        assert_eq!(param_names(&module).unwrap(), vec!["a", "b"]);
        assert_eq!(num_params(&module).unwrap(), 10);
    }

    #[test]
    fn invalid_or_duplicate_names_are_rejected() {
        assert!(param_names(&pair("a")).is_err());
        assert!(param_names(&pair("b.c")).is_err());
        assert!(param_names(&pair("")).is_err());
    }
}
