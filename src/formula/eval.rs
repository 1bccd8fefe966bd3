//! Free-name extraction and pure evaluation of formula ASTs.

use std::collections::{BTreeMap, BTreeSet};

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::FormulaError;

/// A builtin numeric function. Arity is validated before the call.
pub type BuiltinFn = fn(&[f64]) -> f64;

/// A builtin function entry: fixed arity plus the function itself.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub arity: usize,
    pub apply: BuiltinFn,
}

impl std::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builtin").field("arity", &self.arity).finish()
    }
}

/// Symbol-to-function table for formula evaluation.
pub type BuiltinTable = BTreeMap<String, Builtin>;

/// The default builtin set: common unary math functions plus binary
/// `min`/`max`.
#[must_use]
pub fn default_builtins() -> BuiltinTable {
    fn unary(apply: BuiltinFn) -> Builtin {
        Builtin { arity: 1, apply }
    }

    let mut table = BuiltinTable::new();
    table.insert("sqrt".to_string(), unary(|a| a[0].sqrt()));
    table.insert("abs".to_string(), unary(|a| a[0].abs()));
    table.insert("exp".to_string(), unary(|a| a[0].exp()));
    table.insert("ln".to_string(), unary(|a| a[0].ln()));
    table.insert("log10".to_string(), unary(|a| a[0].log10()));
    table.insert("sin".to_string(), unary(|a| a[0].sin()));
    table.insert("cos".to_string(), unary(|a| a[0].cos()));
    table.insert("tan".to_string(), unary(|a| a[0].tan()));
    table.insert("floor".to_string(), unary(|a| a[0].floor()));
    table.insert("ceil".to_string(), unary(|a| a[0].ceil()));
    table.insert(
        "min".to_string(),
        Builtin {
            arity: 2,
            apply: |a| a[0].min(a[1]),
        },
    );
    table.insert(
        "max".to_string(),
        Builtin {
            arity: 2,
            apply: |a| a[0].max(a[1]),
        },
    );
    table
}

/// The free names of an expression: identifiers not bound to builtins.
///
/// Call targets are function names, not value references, so they are
/// excluded; an unknown call target surfaces at evaluation instead.
#[must_use]
pub fn free_names(expr: &Expr, builtins: &BuiltinTable) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_names(expr, builtins, &mut names);
    names
}

fn collect_names(expr: &Expr, builtins: &BuiltinTable, names: &mut BTreeSet<String>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Ident(name) => {
            if !builtins.contains_key(name) {
                names.insert(name.clone());
            }
        }
        Expr::Call(_, args) => {
            for arg in args {
                collect_names(arg, builtins, names);
            }
        }
        Expr::Unary(_, inner) => collect_names(inner, builtins, names),
        Expr::Binary(_, lhs, rhs) => {
            collect_names(lhs, builtins, names);
            collect_names(rhs, builtins, names);
        }
    }
}

/// Evaluate an expression against a symbol table.
///
/// Division by zero and non-finite intermediate results are errors; an
/// identifier absent from `symbols` is [`FormulaError::MissingName`].
pub fn eval(
    expr: &Expr,
    symbols: &BTreeMap<String, f64>,
    builtins: &BuiltinTable,
) -> Result<f64, FormulaError> {
    let value = match expr {
        Expr::Number(value) => *value,
        Expr::Ident(name) => symbols
            .get(name)
            .copied()
            .ok_or_else(|| FormulaError::MissingName(name.clone()))?,
        Expr::Call(name, args) => {
            let builtin = builtins
                .get(name)
                .ok_or_else(|| FormulaError::UnknownFunction(name.clone()))?;
            if args.len() != builtin.arity {
                return Err(FormulaError::Arity {
                    name: name.clone(),
                    expected: builtin.arity,
                    got: args.len(),
                });
            }
            let values = args
                .iter()
                .map(|arg| eval(arg, symbols, builtins))
                .collect::<Result<Vec<_>, _>>()?;
            (builtin.apply)(&values)
        }
        Expr::Unary(UnaryOp::Neg, inner) => -eval(inner, symbols, builtins)?,
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, symbols, builtins)?;
            let rhs = eval(rhs, symbols, builtins)?;
            match op {
                BinaryOp::Add => lhs + rhs,
                BinaryOp::Sub => lhs - rhs,
                BinaryOp::Mul => lhs * rhs,
                BinaryOp::Div => {
                    if rhs == 0.0 {
                        return Err(FormulaError::DivisionByZero);
                    }
                    lhs / rhs
                }
                BinaryOp::Pow => lhs.powf(rhs),
            }
        }
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(FormulaError::NonFinite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parse;

    fn symbols(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect()
    }

    fn run(formula: &str, syms: &[(&str, f64)]) -> Result<f64, FormulaError> {
        eval(&parse(formula).unwrap(), &symbols(syms), &default_builtins())
    }

    #[test]
    fn test_eval_arithmetic() {
        assert_eq!(run("2 * 3.14", &[]).unwrap(), 6.28);
        assert_eq!(run("2 ** 3", &[]).unwrap(), 8.0);
        assert_eq!(run("2 * 2 * 2", &[]).unwrap(), 8.0);
        assert_eq!(run("1 + 2 * 3", &[]).unwrap(), 7.0);
        assert_eq!(run("-2 ** 2", &[]).unwrap(), -4.0);
        assert_eq!(run("2 ** -1", &[]).unwrap(), 0.5);
    }

    #[test]
    fn test_eval_symbols() {
        assert_eq!(run("foo + bar + D", &[("foo", 4.0), ("bar", 8.0), ("D", 8.0)]).unwrap(), 20.0);
        assert_eq!(run("F + D * 2", &[("F", 3.0), ("D", 8.0)]).unwrap(), 19.0);
    }

    #[test]
    fn test_eval_missing_name() {
        assert_eq!(
            run("2 * foo", &[]),
            Err(FormulaError::MissingName("foo".to_string()))
        );
    }

    #[test]
    fn test_eval_builtins() {
        assert_eq!(run("sqrt(16)", &[]).unwrap(), 4.0);
        assert_eq!(run("max(2, 7)", &[]).unwrap(), 7.0);
        assert_eq!(run("min(2, 7) + ceil(0.2)", &[]).unwrap(), 3.0);
    }

    #[test]
    fn test_eval_unknown_function_and_arity() {
        assert_eq!(
            run("frob(1)", &[]),
            Err(FormulaError::UnknownFunction("frob".to_string()))
        );
        assert_eq!(
            run("sqrt(1, 2)", &[]),
            Err(FormulaError::Arity {
                name: "sqrt".to_string(),
                expected: 1,
                got: 2,
            })
        );
    }

    #[test]
    fn test_eval_division_by_zero() {
        assert_eq!(run("1 / 0", &[]), Err(FormulaError::DivisionByZero));
        assert_eq!(run("1 / (2 - 2)", &[]), Err(FormulaError::DivisionByZero));
    }

    #[test]
    fn test_eval_non_finite() {
        assert_eq!(run("10 ** 400", &[]), Err(FormulaError::NonFinite));
        assert_eq!(run("sqrt(0 - 1)", &[]), Err(FormulaError::NonFinite));
    }

    #[test]
    fn test_free_names_skip_builtins() {
        let builtins = default_builtins();
        let expr = parse("sqrt(foo) + max(bar, 2) - baz").unwrap();
        let names = free_names(&expr, &builtins);
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["bar".to_string(), "baz".to_string(), "foo".to_string()]
        );
    }
}
