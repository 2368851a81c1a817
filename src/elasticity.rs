//! Elasticity policies
//!
//! Expressions such as `CPU > 80 & MEMORY < 2048` are evaluated against the
//! mean monitoring values of a role's running VMs. A policy fires after
//! `period_number` consecutive true evaluations spaced `period` seconds apart.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::models::{ElasticityPolicy, PolicyType, Role};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    Attribute(String),
}

impl Operand {
    fn value(&self, metrics: &BTreeMap<String, f64>) -> Option<f64> {
        match self {
            Operand::Number(n) => Some(*n),
            Operand::Attribute(name) => metrics.get(name).copied(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    fn apply(&self, l: f64, r: f64) -> bool {
        match self {
            CmpOp::Gt => l > r,
            CmpOp::Lt => l < r,
            CmpOp::Ge => l >= r,
            CmpOp::Le => l <= r,
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
        }
    }
}

/// Parsed policy expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Or(Box<Expression>, Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Compare(Operand, CmpOp, Operand),
    /// Bare operand, true when non-zero
    Value(Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                tokens.push(Token::And);
                i += if next == Some('&') { 2 } else { 1 };
            }
            '|' => {
                tokens.push(Token::Or);
                i += if next == Some('|') { 2 } else { 1 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' | '=' => {
                let eq = next == Some('=');
                let op = match (c, eq) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    _ => CmpOp::Eq,
                };
                tokens.push(Token::Cmp(op));
                i += if eq { 2 } else { 1 };
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && next.map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| Error::Validation(format!("invalid number '{}' in expression", text)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(Error::Validation(format!(
                    "unexpected character '{}' in expression '{}'",
                    other, input
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or(&mut self) -> Result<Expression> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expression> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression> {
        match self.peek() {
            Some(Token::Not) => {
                self.bump();
                Ok(Expression::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.bump();
                let inner = self.or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::validation("missing ')' in expression")),
                }
            }
            _ => self.compare(),
        }
    }

    fn compare(&mut self) -> Result<Expression> {
        let left = self.operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.bump();
            let right = self.operand()?;
            return Ok(Expression::Compare(left, op, right));
        }
        Ok(Expression::Value(left))
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Operand::Number(n)),
            Some(Token::Ident(name)) => Ok(Operand::Attribute(name)),
            other => Err(Error::Validation(format!(
                "expected a number or attribute, found {:?}",
                other
            ))),
        }
    }
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(Error::validation("empty elasticity expression"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(Error::Validation(format!(
                "trailing input in expression '{}'",
                input
            )));
        }
        Ok(expr)
    }

    /// Comparisons on attributes without a value are false
    pub fn evaluate(&self, metrics: &BTreeMap<String, f64>) -> bool {
        match self {
            Expression::Or(l, r) => l.evaluate(metrics) || r.evaluate(metrics),
            Expression::And(l, r) => l.evaluate(metrics) && r.evaluate(metrics),
            Expression::Not(e) => !e.evaluate(metrics),
            Expression::Compare(l, op, r) => match (l.value(metrics), r.value(metrics)) {
                (Some(a), Some(b)) => op.apply(a, b),
                _ => false,
            },
            Expression::Value(v) => v.value(metrics).map_or(false, |x| x != 0.0),
        }
    }
}

/// Mean monitoring values over the role's running nodes
pub fn role_metrics(role: &Role) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for vm in role.live_nodes().filter_map(|n| n.vm.as_ref()).filter(|vm| vm.is_running()) {
        for (name, value) in &vm.monitoring {
            let entry = sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(name, (sum, count))| (name, sum / count as f64))
        .collect()
}

/// Cardinality a policy asks for, clamped to the role bounds.
/// Arithmetic saturates so oversized adjustments just hit a bound.
pub fn target_cardinality(policy: &ElasticityPolicy, current: usize, min: usize, max: usize) -> usize {
    let current_i = i64::try_from(current).unwrap_or(i64::MAX);
    let target = match policy.policy_type {
        PolicyType::Change => current_i.saturating_add(policy.adjust),
        PolicyType::Cardinality => policy.adjust,
        PolicyType::PercentageChange => {
            let mut delta = current_i.saturating_mul(policy.adjust) / 100;
            if let Some(step) = policy.min_adjust_step {
                let step = i64::try_from(step).unwrap_or(i64::MAX);
                if delta.abs() < step {
                    delta = step * policy.adjust.signum();
                }
            }
            current_i.saturating_add(delta)
        }
    };
    usize::try_from(target.max(0)).unwrap_or(usize::MAX).clamp(min, max)
}

/// Outcome of a policy evaluation that requires scaling
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecision {
    pub target: usize,
    pub cooldown: Option<u64>,
    pub expression: String,
}

/// Evaluate the role's policies at `now`. The first policy that fires and
/// changes the cardinality wins; counters of evaluated policies are updated.
pub fn evaluate_role(role: &mut Role, now: DateTime<Utc>) -> Option<ScaleDecision> {
    if role.elasticity_policies.is_empty() {
        return None;
    }
    let metrics = role_metrics(role);
    let (cardinality, min, max) = (role.cardinality, role.min_vms, role.max_vms);

    for policy in role.elasticity_policies.iter_mut() {
        if let Some(last) = policy.last_eval {
            if (now - last).num_seconds() < policy.period as i64 {
                continue;
            }
        }
        policy.last_eval = Some(now);

        let expr = match Expression::parse(&policy.expression) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(role = %role.name, error = %e, "Skipping invalid elasticity expression");
                continue;
            }
        };

        if expr.evaluate(&metrics) {
            policy.true_evals += 1;
        } else {
            policy.true_evals = 0;
            continue;
        }

        if policy.true_evals >= policy.period_number.max(1) {
            policy.true_evals = 0;
            let target = target_cardinality(policy, cardinality, min, max);
            if target != cardinality {
                tracing::info!(
                    role = %role.name,
                    expression = %policy.expression,
                    from = cardinality,
                    to = target,
                    "Elasticity policy triggered"
                );
                return Some(ScaleDecision {
                    target,
                    cooldown: policy.cooldown,
                    expression: policy.expression.clone(),
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LcmState, Node, VmInfo, VmState};

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_simple_comparison() {
        let e = Expression::parse("CPU > 80").unwrap();
        assert!(e.evaluate(&metrics(&[("CPU", 90.0)])));
        assert!(!e.evaluate(&metrics(&[("CPU", 80.0)])));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let e = Expression::parse("CPU > 80 | MEM < 10 & NET >= 5").unwrap();
        // & binds tighter than |
        assert!(e.evaluate(&metrics(&[("CPU", 90.0), ("MEM", 50.0), ("NET", 0.0)])));
        assert!(e.evaluate(&metrics(&[("CPU", 0.0), ("MEM", 5.0), ("NET", 5.0)])));
        assert!(!e.evaluate(&metrics(&[("CPU", 0.0), ("MEM", 5.0), ("NET", 1.0)])));

        let e = Expression::parse("!(CPU <= 10) && (ATT == 1 || ATT != 3)").unwrap();
        assert!(e.evaluate(&metrics(&[("CPU", 20.0), ("ATT", 1.0)])));
        assert!(!e.evaluate(&metrics(&[("CPU", 5.0), ("ATT", 1.0)])));
    }

    #[test]
    fn test_unknown_attribute_is_false() {
        let e = Expression::parse("MISSING > 1").unwrap();
        assert!(!e.evaluate(&BTreeMap::new()));
        let e = Expression::parse("!(MISSING > 1)").unwrap();
        assert!(e.evaluate(&BTreeMap::new()));
    }

    #[test]
    fn test_negative_and_decimal_numbers() {
        let e = Expression::parse("TEMP < -1.5").unwrap();
        assert!(e.evaluate(&metrics(&[("TEMP", -3.0)])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("").is_err());
        assert!(Expression::parse("CPU >").is_err());
        assert!(Expression::parse("(CPU > 1").is_err());
        assert!(Expression::parse("CPU > 1 2").is_err());
        assert!(Expression::parse("CPU $ 2").is_err());
    }

    #[test]
    fn test_deterministic_evaluation() {
        let e = Expression::parse("CPU > 50 & MEM < 100").unwrap();
        let m = metrics(&[("CPU", 60.0), ("MEM", 20.0)]);
        let first = e.evaluate(&m);
        assert!((0..10).all(|_| e.evaluate(&m) == first));
    }

    #[test]
    fn test_target_cardinality() {
        let change = ElasticityPolicy::new(PolicyType::Change, 2, "X");
        assert_eq!(target_cardinality(&change, 3, 1, 10), 5);
        assert_eq!(target_cardinality(&change, 9, 1, 10), 10);

        let shrink = ElasticityPolicy::new(PolicyType::Change, -5, "X");
        assert_eq!(target_cardinality(&shrink, 3, 1, 10), 1);

        let card = ElasticityPolicy::new(PolicyType::Cardinality, 4, "X");
        assert_eq!(target_cardinality(&card, 1, 1, 10), 4);

        let pct = ElasticityPolicy::new(PolicyType::PercentageChange, 50, "X");
        assert_eq!(target_cardinality(&pct, 4, 1, 10), 6);

        let pct_step = ElasticityPolicy::new(PolicyType::PercentageChange, 10, "X").with_min_adjust_step(2);
        assert_eq!(target_cardinality(&pct_step, 4, 1, 10), 6);

        let pct_down = ElasticityPolicy::new(PolicyType::PercentageChange, -10, "X").with_min_adjust_step(1);
        assert_eq!(target_cardinality(&pct_down, 4, 1, 10), 3);
    }

    #[test]
    fn test_oversized_adjustments_saturate() {
        let grow = ElasticityPolicy::new(PolicyType::Change, i64::MAX, "X");
        assert_eq!(target_cardinality(&grow, 3, 1, 10), 10);

        let shrink = ElasticityPolicy::new(PolicyType::Change, i64::MIN, "X");
        assert_eq!(target_cardinality(&shrink, 3, 1, 10), 1);

        let pct = ElasticityPolicy::new(PolicyType::PercentageChange, i64::MAX / 2, "X");
        assert_eq!(target_cardinality(&pct, 3, 1, 10), 10);

        let pct_down = ElasticityPolicy::new(PolicyType::PercentageChange, i64::MIN, "X");
        assert_eq!(target_cardinality(&pct_down, 3, 1, 10), 1);

        let big_step = ElasticityPolicy::new(PolicyType::PercentageChange, -1, "X")
            .with_min_adjust_step(u64::MAX);
        assert_eq!(target_cardinality(&big_step, 3, 1, 10), 1);
    }

    fn running_role(cpu: &[f64]) -> Role {
        let mut role = Role::new("web", 0, cpu.len()).with_bounds(1, 10);
        for (i, c) in cpu.iter().enumerate() {
            let mut vm = VmInfo::new(i as u64, "vm", 0).with_state(VmState::Active, LcmState::Running);
            vm.monitoring.insert("CPU".into(), *c);
            let mut node = Node::new(i as u64);
            node.update(vm);
            role.nodes.push(node);
        }
        role
    }

    #[test]
    fn test_role_metrics_average() {
        let role = running_role(&[40.0, 80.0]);
        assert_eq!(role_metrics(&role)["CPU"], 60.0);
    }

    #[test]
    fn test_policy_needs_consecutive_periods() {
        let mut role = running_role(&[90.0, 90.0]);
        role.elasticity_policies
            .push(ElasticityPolicy::new(PolicyType::Change, 1, "CPU > 80").with_period(2, 0).with_cooldown(60));

        let now = Utc::now();
        assert_eq!(evaluate_role(&mut role, now), None);
        let decision = evaluate_role(&mut role, now).unwrap();
        assert_eq!(decision.target, 3);
        assert_eq!(decision.cooldown, Some(60));
        assert_eq!(role.elasticity_policies[0].true_evals, 0);
    }

    #[test]
    fn test_policy_period_spacing() {
        let mut role = running_role(&[90.0]);
        role.elasticity_policies
            .push(ElasticityPolicy::new(PolicyType::Change, 1, "CPU > 80").with_period(2, 30));

        let t0 = Utc::now();
        assert_eq!(evaluate_role(&mut role, t0), None);
        // Too early, not evaluated
        assert_eq!(evaluate_role(&mut role, t0 + chrono::Duration::seconds(10)), None);
        assert_eq!(role.elasticity_policies[0].true_evals, 1);
        assert!(evaluate_role(&mut role, t0 + chrono::Duration::seconds(30)).is_some());
    }

    #[test]
    fn test_false_evaluation_resets_counter() {
        let mut role = running_role(&[90.0]);
        role.elasticity_policies
            .push(ElasticityPolicy::new(PolicyType::Change, 1, "CPU > 80").with_period(2, 0));
        let now = Utc::now();
        evaluate_role(&mut role, now);
        role.nodes[0].vm.as_mut().unwrap().monitoring.insert("CPU".into(), 10.0);
        evaluate_role(&mut role, now);
        assert_eq!(role.elasticity_policies[0].true_evals, 0);
    }

    #[test]
    fn test_policy_at_bound_does_not_fire() {
        let mut role = running_role(&[90.0]).with_bounds(1, 1);
        role.elasticity_policies
            .push(ElasticityPolicy::new(PolicyType::Change, 1, "CPU > 80"));
        assert_eq!(evaluate_role(&mut role, Utc::now()), None);
    }
}
