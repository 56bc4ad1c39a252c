/// SQL expression → AST parser.
///
/// Raw predicates (`Q::raw("salary > 1000")`) are parsed with `sqlparser`
/// and translated into our internal expression tree, so they compile through
/// the same path as lookup predicates.
use sqlparser::ast as sp;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;

use super::descriptor::CompileError;
use super::types::*;

type Result<T> = std::result::Result<T, CompileError>;

/// Parse a standalone SQL boolean/scalar expression.
pub fn parse_expr(sql: &str) -> Result<Expression> {
    let dialect = PostgreSqlDialect {};
    let expr = SqlParser::new(&dialect)
        .try_with_sql(sql)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| CompileError::RawExpression(format!("{}: {}", sql, e)))?;
    convert_expr(expr)
}

fn convert_expr(expr: sp::Expr) -> Result<Expression> {
    match expr {
        sp::Expr::Identifier(ident) => Ok(Expression::Column {
            table: None,
            name: ident.value,
        }),
        sp::Expr::CompoundIdentifier(parts) => {
            let mut names: Vec<String> = parts.into_iter().map(|p| p.value).collect();
            match names.len() {
                2 => {
                    let name = names.pop().unwrap_or_default();
                    Ok(Expression::Column {
                        table: names.pop(),
                        name,
                    })
                }
                _ => Ok(Expression::Column {
                    table: None,
                    name: names.join("."),
                }),
            }
        }
        sp::Expr::Value(val) => convert_value(val),
        sp::Expr::BinaryOp { left, op, right } => Ok(Expression::BinaryOp {
            left: Box::new(convert_expr(*left)?),
            op: convert_binary_op(op)?,
            right: Box::new(convert_expr(*right)?),
        }),
        sp::Expr::UnaryOp { op, expr } => Ok(Expression::UnaryOp {
            op: convert_unary_op(op)?,
            expr: Box::new(convert_expr(*expr)?),
        }),
        sp::Expr::Function(func) => convert_function(func),
        sp::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            let when_clauses = conditions
                .into_iter()
                .zip(results)
                .map(|(c, r)| Ok((convert_expr(c)?, convert_expr(r)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expression::Case {
                operand: operand.map(|o| convert_expr(*o)).transpose()?.map(Box::new),
                when_clauses,
                else_clause: else_result
                    .map(|e| convert_expr(*e))
                    .transpose()?
                    .map(Box::new),
            })
        }
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expression::InList {
            expr: Box::new(convert_expr(*expr)?),
            list: list
                .into_iter()
                .map(convert_expr)
                .collect::<Result<Vec<_>>>()?,
            negated,
        }),
        sp::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expression::Between {
            expr: Box::new(convert_expr(*expr)?),
            low: Box::new(convert_expr(*low)?),
            high: Box::new(convert_expr(*high)?),
            negated,
        }),
        sp::Expr::IsNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: false,
        }),
        sp::Expr::IsNotNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: true,
        }),
        sp::Expr::Cast {
            expr, data_type, ..
        } => Ok(Expression::Cast {
            expr: Box::new(convert_expr(*expr)?),
            data_type: data_type.to_string(),
        }),
        sp::Expr::Nested(expr) => Ok(Expression::Nested(Box::new(convert_expr(*expr)?))),
        sp::Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => {
            let op = if negated {
                BinaryOperator::NotLike
            } else {
                BinaryOperator::Like
            };
            Ok(Expression::binary(
                convert_expr(*expr)?,
                op,
                convert_expr(*pattern)?,
            ))
        }
        sp::Expr::ILike {
            negated,
            expr,
            pattern,
            ..
        } => {
            let op = if negated {
                BinaryOperator::NotILike
            } else {
                BinaryOperator::ILike
            };
            Ok(Expression::binary(
                convert_expr(*expr)?,
                op,
                convert_expr(*pattern)?,
            ))
        }
        other => Err(CompileError::RawExpression(format!(
            "unsupported expression: {}",
            other
        ))),
    }
}

fn convert_value(val: sp::Value) -> Result<Expression> {
    match val {
        sp::Value::Null => Ok(Expression::Literal(Literal::Null)),
        sp::Value::Boolean(b) => Ok(Expression::Literal(Literal::Boolean(b))),
        sp::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Expression::Literal(Literal::Integer(i)))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Expression::Literal(Literal::Float(f)))
            } else {
                Err(CompileError::RawExpression(format!("invalid number: {}", n)))
            }
        }
        sp::Value::SingleQuotedString(s) => Ok(Expression::Literal(Literal::String(s))),
        // Raw predicates carry no bind values, so placeholders would be dangling.
        sp::Value::Placeholder(p) => Err(CompileError::RawExpression(format!(
            "placeholders are not allowed in raw predicates: {}",
            p
        ))),
        other => Ok(Expression::Literal(Literal::String(other.to_string()))),
    }
}

fn convert_binary_op(op: sp::BinaryOperator) -> Result<BinaryOperator> {
    match op {
        sp::BinaryOperator::Eq => Ok(BinaryOperator::Eq),
        sp::BinaryOperator::NotEq => Ok(BinaryOperator::NotEq),
        sp::BinaryOperator::Lt => Ok(BinaryOperator::Lt),
        sp::BinaryOperator::LtEq => Ok(BinaryOperator::LtEq),
        sp::BinaryOperator::Gt => Ok(BinaryOperator::Gt),
        sp::BinaryOperator::GtEq => Ok(BinaryOperator::GtEq),
        sp::BinaryOperator::And => Ok(BinaryOperator::And),
        sp::BinaryOperator::Or => Ok(BinaryOperator::Or),
        sp::BinaryOperator::Plus => Ok(BinaryOperator::Plus),
        sp::BinaryOperator::Minus => Ok(BinaryOperator::Minus),
        sp::BinaryOperator::Multiply => Ok(BinaryOperator::Multiply),
        sp::BinaryOperator::Divide => Ok(BinaryOperator::Divide),
        sp::BinaryOperator::Modulo => Ok(BinaryOperator::Modulo),
        sp::BinaryOperator::StringConcat => Ok(BinaryOperator::Concat),
        _ => Err(CompileError::RawExpression(format!(
            "unsupported binary operator: {:?}",
            op
        ))),
    }
}

fn convert_unary_op(op: sp::UnaryOperator) -> Result<UnaryOperator> {
    match op {
        sp::UnaryOperator::Not => Ok(UnaryOperator::Not),
        sp::UnaryOperator::Minus => Ok(UnaryOperator::Minus),
        sp::UnaryOperator::Plus => Ok(UnaryOperator::Plus),
        _ => Err(CompileError::RawExpression(format!(
            "unsupported unary operator: {:?}",
            op
        ))),
    }
}

fn convert_function(func: sp::Function) -> Result<Expression> {
    let name = func.name.to_string().to_uppercase();
    if func.over.is_some() {
        return Err(CompileError::RawExpression(format!(
            "window functions are not allowed in predicates: {}",
            name
        )));
    }

    let (args, distinct) = match func.args {
        sp::FunctionArguments::List(arg_list) => {
            let distinct = matches!(
                arg_list.duplicate_treatment,
                Some(sp::DuplicateTreatment::Distinct)
            );
            let args = arg_list
                .args
                .into_iter()
                .filter_map(|a| match a {
                    sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => Some(convert_expr(e)),
                    sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => {
                        Some(Ok(Expression::Wildcard))
                    }
                    _ => None,
                })
                .collect::<Result<Vec<_>>>()?;
            (args, distinct)
        }
        sp::FunctionArguments::None => (vec![], false),
        sp::FunctionArguments::Subquery(_) => {
            return Err(CompileError::RawExpression(format!(
                "subqueries are not allowed in predicates: {}",
                name
            )))
        }
    };

    Ok(Expression::Function {
        name,
        args,
        distinct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::compiler::compile_expr;

    #[test]
    fn test_parse_comparison() {
        let expr = parse_expr("salary > 1000").unwrap();
        assert_eq!(compile_expr(&expr), "salary > 1000");
    }

    #[test]
    fn test_parse_compound_identifier() {
        let expr = parse_expr("e.name = 'Alice'").unwrap();
        assert_eq!(compile_expr(&expr), "\"e\".\"name\" = 'Alice'");
    }

    #[test]
    fn test_parse_function_and_like() {
        let expr = parse_expr("lower(name) LIKE 'a%'").unwrap();
        assert_eq!(compile_expr(&expr), "LOWER(name) LIKE 'a%'");
    }

    #[test]
    fn test_parse_between_and_null_checks() {
        let expr = parse_expr("age BETWEEN 18 AND 65 AND email IS NOT NULL").unwrap();
        let sql = compile_expr(&expr);
        assert!(sql.contains("BETWEEN 18 AND 65"));
        assert!(sql.contains("IS NOT NULL"));
    }

    #[test]
    fn test_parse_rejects_placeholders() {
        let err = parse_expr("id = $1").unwrap_err();
        assert!(matches!(err, CompileError::RawExpression(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_expr("salary >").is_err());
    }
}
