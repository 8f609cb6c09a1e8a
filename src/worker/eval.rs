//! Arithmetic expression evaluation and prime counting.

/// Deepest nesting of parentheses and unary signs the parser will follow.
pub const MAX_NESTING: usize = 256;

/// Evaluate `+ - * /` over decimal literals with parentheses and unary minus.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let mut parser = Parser {
        src: expression.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos < parser.src.len() {
        return Err(format!(
            "unexpected {:?} at position {}",
            parser.src[parser.pos] as char, parser.pos
        ));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".to_string());
    }
    Ok(value)
}

/// Render a number the way clients expect: integral values without a
/// fractional part.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Number of primes less than or equal to `limit` (sieve of Eratosthenes).
pub fn count_primes(limit: u64) -> u64 {
    if limit < 2 {
        return 0;
    }
    let n = limit as usize;
    let mut composite = vec![false; n + 1];
    let mut count = 0;
    for i in 2..=n {
        if composite[i] {
            continue;
        }
        count += 1;
        let mut multiple = i.saturating_mul(i);
        while multiple <= n {
            composite[multiple] = true;
            multiple += i;
        }
    }
    count
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ (b'+' | b'-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == b'+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    // term := factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op @ (b'*' | b'/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == b'*' {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    return Err("division by zero".to_string());
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, String> {
        if self.depth >= MAX_NESTING {
            return Err("expression nested too deeply".to_string());
        }
        self.depth += 1;
        let value = self.unary();
        self.depth -= 1;
        value
    }

    // factor := '-' factor | '(' expr ')' | number
    fn unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some(b'+') => {
                self.pos += 1;
                self.factor()
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(b')') {
                    return Err(format!("expected ')' at position {}", self.pos));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) => Err(format!(
                "unexpected {:?} at position {}",
                c as char, self.pos
            )),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn number(&mut self) -> Result<f64, String> {
        let start = self.pos;
        while self.pos < self.src.len()
            && (self.src[self.pos].is_ascii_digit() || self.src[self.pos] == b'.')
        {
            self.pos += 1;
        }
        let literal = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|e| format!("invalid number: {e}"))?;
        literal
            .parse()
            .map_err(|_| format!("invalid number {literal:?}"))
    }
}
