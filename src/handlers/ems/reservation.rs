use thiserror::Error;

use crate::models::system_models::ReservationState;

// --------------------------------------------------------------------------------------------------------------
// User-supplied battery reservation equation. The user writes an arithmetic expression over the
// placeholder SOC (current state of charge in percent), e.g. "min(10000, (98 - SOC) * 500)".
// Only a small grammar is admitted: numbers, SOC, + - * /, parentheses and min/max. The
// evaluation is a pure function of the SoC and performs no I/O.

/// DESS reactive strategies that mean the dispatcher is idle; an idle
/// dispatcher zeroes the reservation so surplus flows to consumers.
const DESS_IDLE_STRATEGIES: [i64; 4] = [5, 8, 9, 15];

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' in reservation equation")]
    UnexpectedChar(char),
    #[error("reservation equation ended unexpectedly")]
    UnexpectedEnd,
    #[error("unexpected token '{0}' in reservation equation")]
    UnexpectedToken(String),
    #[error("unknown identifier '{0}'; only SOC, min and max are allowed")]
    UnknownIdentifier(String),
    #[error("division by zero in reservation equation")]
    DivisionByZero,
}

// --------------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

fn tokenize(expression: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => { chars.next(); tokens.push(Token::Plus); }
            '-' => { chars.next(); tokens.push(Token::Minus); }
            '*' => { chars.next(); tokens.push(Token::Star); }
            '/' => { chars.next(); tokens.push(Token::Slash); }
            '(' => { chars.next(); tokens.push(Token::LParen); }
            ')' => { chars.next(); tokens.push(Token::RParen); }
            ',' => { chars.next(); tokens.push(Token::Comma); }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken(literal.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ExprError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

// --------------------------------------------------------------------------------------------------------------

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    soc: f64,
}

impl<'a> Parser<'a> {
    // The returned tokens borrow from the token slice, not from the parser,
    // so advancing the cursor stays possible while one is held.
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&'a Token, ExprError> {
        let token = self.tokens.get(self.pos).ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        let token = self.next()?;
        if *token == expected {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken(format!("{:?}", token)))
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, ExprError> {
        let mut value = self.term()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Plus => { self.pos += 1; value += self.term()?; }
                Token::Minus => { self.pos += 1; value -= self.term()?; }
                _ => break,
            }
        }
        Ok(value)
    }

    // term := factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<f64, ExprError> {
        let mut value = self.factor()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Star => { self.pos += 1; value *= self.factor()?; }
                Token::Slash => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // factor := number | SOC | '-' factor | '(' expr ')' | ('min' | 'max') '(' expr ',' expr ')'
    fn factor(&mut self) -> Result<f64, ExprError> {
        match self.next()?.clone() {
            Token::Number(value) => Ok(value),
            Token::Minus => Ok(-self.factor()?),
            Token::LParen => {
                let value = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Token::Ident(name) => match name.as_str() {
                "SOC" => Ok(self.soc),
                "min" | "max" => {
                    self.expect(Token::LParen)?;
                    let a = self.expr()?;
                    self.expect(Token::Comma)?;
                    let b = self.expr()?;
                    self.expect(Token::RParen)?;
                    Ok(if name == "min" { a.min(b) } else { a.max(b) })
                }
                _ => Err(ExprError::UnknownIdentifier(name)),
            },
            other => Err(ExprError::UnexpectedToken(format!("{:?}", other))),
        }
    }
}

/// Evaluate a reservation equation against the given SoC (percent).
pub fn evaluate_reservation(expression: &str, soc: f64) -> Result<f64, ExprError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(ExprError::UnexpectedEnd);
    }

    let mut parser = Parser { tokens: &tokens, pos: 0, soc };
    let value = parser.expr()?;

    if parser.pos != tokens.len() {
        return Err(ExprError::UnexpectedToken(format!("{:?}", tokens[parser.pos])));
    }

    Ok(value)
}

// --------------------------------------------------------------------------------------------------------------

/// Everything the reservation decision depends on besides the equation itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReservationInputs {
    /// Battery state of charge in percent, when known.
    pub soc: Option<f64>,
    /// BMS charge-power capability (CCL x CVL) in watts. None when the BMS did
    /// not publish limits; distinct from 0, which forbids charging outright.
    pub charge_power_capability: Option<f64>,
    /// Positive DESS charge rate in watts, when the dispatcher issued one.
    pub dess_charge_rate: Option<f64>,
    /// DESS reactive strategy code.
    pub dess_reactive_strategy: Option<i64>,
}

/// The battery reservation in effect for this tick: the user equation, capped
/// by what the BMS can physically charge with and by any active DESS dispatch.
/// Equation failures publish ERROR and fall back to a zero reservation.
pub fn current_battery_reservation(
    equation: &str,
    inputs: &ReservationInputs,
) -> (f64, ReservationState) {
    let soc = match inputs.soc {
        Some(soc) => soc,
        None => return (0.0, ReservationState::Error),
    };

    let mut reservation = match evaluate_reservation(equation, soc) {
        Ok(value) => value.round(),
        Err(_) => return (0.0, ReservationState::Error),
    };
    let mut state = ReservationState::Ok;

    if let Some(capability) = inputs.charge_power_capability {
        if capability < reservation {
            reservation = capability;
            state = ReservationState::Bms;
        }
    }

    // Only a positive DESS charge rate lowers the reservation; a lower rate
    // than the equation would otherwise cause unused feed-in.
    if let Some(rate) = inputs.dess_charge_rate {
        if rate > 0.0 && rate < reservation {
            reservation = rate;
            state = ReservationState::Dess;
        }
    }

    if let Some(strategy) = inputs.dess_reactive_strategy {
        if DESS_IDLE_STRATEGIES.contains(&strategy) {
            reservation = 0.0;
            state = ReservationState::Dess;
        }
    }

    (reservation, state)
}

// --------------------------------------------------------------------------------------------------------------
