use regex::Regex;

use super::Expr;
use super::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Symbol(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '<' => {
                let sym = match chars.get(i + 1) {
                    Some('=') => "<=",
                    Some('>') => "<>",
                    _ => "<",
                };
                i += sym.len();
                tokens.push(Token::Symbol(sym));
            }
            '>' => {
                let sym = if chars.get(i + 1) == Some(&'=') { ">=" } else { ">" };
                i += sym.len();
                tokens.push(Token::Symbol(sym));
            }
            '=' => {
                tokens.push(Token::Symbol("="));
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Symbol(match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    _ => "/",
                }));
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                let mut is_float = false;
                while let Some(&d) = chars.get(i) {
                    if d.is_ascii_digit() {
                        i += 1;
                    } else if d == '.' || d == 'e' || d == 'E' {
                        is_float = true;
                        i += 1;
                        if (d == 'e' || d == 'E') && matches!(chars.get(i), Some('+') | Some('-')) {
                            i += 1;
                        }
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                // Long and float suffixes are accepted and ignored.
                if matches!(chars.get(i), Some('l') | Some('L')) {
                    i += 1;
                } else if matches!(chars.get(i), Some('f') | Some('F') | Some('d') | Some('D')) {
                    is_float = true;
                    i += 1;
                }
                if is_float {
                    let value = text.parse::<f64>().map_err(|e| format!("bad number {text}: {e}"))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text.parse::<i64>().map_err(|e| format!("bad number {text}: {e}"))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|d| d.is_alphanumeric() || *d == '_' || *d == '$' || *d == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

/// Translate a LIKE pattern (`%`, `_`, optional escape) into an anchored regex.
fn like_regex(pattern: &str, escape: Option<char>) -> Result<Regex, String> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            match chars.next() {
                Some(next) => re.push_str(&regex::escape(&next.to_string())),
                None => return Err("LIKE pattern ends with escape character".to_string()),
            }
        } else if c == '%' {
            re.push_str("(?s:.*)");
        } else if c == '_' {
            re.push_str("(?s:.)");
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| e.to_string())
}

pub(super) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub(super) fn new(input: &str) -> Result<Self, String> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    pub(super) fn parse(mut self) -> Result<Expr, String> {
        if self.tokens.is_empty() {
            return Err("empty selector".to_string());
        }
        let expr = self.or_expr()?;
        match self.peek() {
            None => Ok(expr),
            Some(t) => Err(format!("unexpected trailing token {t:?}")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(word))
    }

    fn keyword_at(&self, offset: usize, word: &str) -> bool {
        matches!(self.tokens.get(self.pos + offset), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(word))
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.keyword(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), String> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(format!("expected {word}"))
        }
    }

    fn eat_symbol(&mut self, symbol: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("OR") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("AND") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.additive()?;

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = self.keyword("NOT")
            && (self.keyword_at(1, "BETWEEN") || self.keyword_at(1, "IN") || self.keyword_at(1, "LIKE"));
        if negated {
            self.pos += 1;
        }

        if self.eat_keyword("BETWEEN") {
            let low = self.additive()?;
            self.expect_keyword("AND")?;
            let high = self.additive()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }

        if self.eat_keyword("IN") {
            if self.next() != Some(Token::LParen) {
                return Err("expected ( after IN".to_string());
            }
            let mut list = Vec::new();
            loop {
                list.push(self.literal()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    _ => return Err("expected , or ) in IN list".to_string()),
                }
            }
            return Ok(Expr::In {
                expr: Box::new(left),
                list,
                negated,
            });
        }

        if self.eat_keyword("LIKE") {
            let Some(Token::Str(pattern)) = self.next() else {
                return Err("LIKE expects a string pattern".to_string());
            };
            let escape = if self.eat_keyword("ESCAPE") {
                let Some(Token::Str(esc)) = self.next() else {
                    return Err("ESCAPE expects a string".to_string());
                };
                let mut chars = esc.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => return Err("ESCAPE must be a single character".to_string()),
                }
            } else {
                None
            };
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern: like_regex(&pattern, escape)?,
                negated,
            });
        }

        if negated {
            return Err("NOT must be followed by BETWEEN, IN or LIKE".to_string());
        }

        for op in ["=", "<>", "<=", ">=", "<", ">"] {
            if self.eat_symbol(op) {
                let right = self.additive()?;
                return Ok(Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                });
            }
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_symbol("+") {
                '+'
            } else if self.eat_symbol("-") {
                '-'
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_symbol("*") {
                '*'
            } else if self.eat_symbol("/") {
                '/'
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat_symbol("-") {
            return Ok(Expr::Negate(Box::new(self.unary()?)));
        }
        if self.eat_symbol("+") {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if self.next() != Some(Token::RParen) {
                    return Err("expected )".to_string());
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let name = name.clone();
                if name.eq_ignore_ascii_case("TRUE") {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::Bool(true)))
                } else if name.eq_ignore_ascii_case("FALSE") {
                    self.pos += 1;
                    Ok(Expr::Literal(Value::Bool(false)))
                } else if is_reserved(&name) {
                    Err(format!("unexpected keyword {name}"))
                } else {
                    self.pos += 1;
                    Ok(Expr::Identifier(name))
                }
            }
            Some(_) => Ok(Expr::Literal(self.literal()?)),
            None => Err("unexpected end of selector".to_string()),
        }
    }

    fn literal(&mut self) -> Result<Value, String> {
        let negative = self.eat_symbol("-");
        match self.next() {
            Some(Token::Str(s)) if !negative => Ok(Value::Str(s)),
            Some(Token::Int(i)) => Ok(Value::Int(if negative { -i } else { i })),
            Some(Token::Float(f)) => Ok(Value::Double(if negative { -f } else { f })),
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("TRUE") => Ok(Value::Bool(true)),
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("FALSE") => Ok(Value::Bool(false)),
            other => Err(format!("expected literal, found {other:?}")),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    ["AND", "OR", "NOT", "BETWEEN", "IN", "LIKE", "ESCAPE", "IS", "NULL"]
        .iter()
        .any(|k| word.eq_ignore_ascii_case(k))
}
