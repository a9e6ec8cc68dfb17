//! Packet Filter
//!
//! Compiles a BPF-style expression once at configuration time and evaluates
//! it against captured packets before dispatch.
//!
//! Supported grammar:
//!
//! ```text
//! expr      := term (("or" | "||") term)*
//! term      := unary (("and" | "&&") unary)*
//! unary     := ("not" | "!") unary | "(" expr ")" | primitive
//!            | (tcp | udp) qualified
//! primitive := qualified | tcp | udp | icmp | ip | ip6 | vlan [N] | proto N
//! qualified := [src | dst] (host ADDR | net CIDR | port N | ADDR)
//! ```
//!
//! `tcp port 443` reads as `tcp and port 443`.

use crate::error::ConfigError;
use crate::packet::Packet;
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;

/// Which endpoint a primitive tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Dst,
    Either,
}

impl Side {
    #[inline]
    fn test<T: Copy>(self, packet: &Packet, field: impl Fn(&Packet) -> (T, T), pred: impl Fn(T) -> bool) -> bool {
        let (src, dst) = field(packet);
        match self {
            Self::Src => pred(src),
            Self::Dst => pred(dst),
            Self::Either => pred(src) || pred(dst),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Primitive {
    Host(Side, IpAddr),
    Net(Side, IpNetwork),
    Port(Side, u16),
    Proto(u8),
    Icmp,
    Ip4,
    Ip6,
    Vlan(Option<u16>),
}

impl Primitive {
    fn matches(&self, packet: &Packet) -> bool {
        let addrs = |p: &Packet| (p.src_ip, p.dst_ip);
        let ports = |p: &Packet| (p.src_port, p.dst_port);
        match self {
            Self::Host(side, ip) => side.test(packet, addrs, |a| a == *ip),
            Self::Net(side, net) => side.test(packet, addrs, |a| net.contains(a)),
            Self::Port(side, port) => side.test(packet, ports, |p| p == *port),
            Self::Proto(proto) => packet.protocol == *proto,
            Self::Icmp => packet.protocol == 1 || packet.protocol == 58,
            Self::Ip4 => packet.ip_version() == 4,
            Self::Ip6 => packet.ip_version() == 6,
            Self::Vlan(None) => packet.vlan_id != 0,
            Self::Vlan(Some(id)) => packet.vlan_id == *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Primitive(Primitive),
}

impl Expr {
    fn matches(&self, packet: &Packet) -> bool {
        match self {
            Self::Or(a, b) => a.matches(packet) || b.matches(packet),
            Self::And(a, b) => a.matches(packet) && b.matches(packet),
            Self::Not(e) => !e.matches(packet),
            Self::Primitive(p) => p.matches(packet),
        }
    }
}

/// Compiled packet filter
#[derive(Debug, Clone, PartialEq)]
pub struct PacketFilter {
    expression: String,
    root: Expr,
}

impl PacketFilter {
    /// Compile an expression
    pub fn compile(expression: &str) -> Result<Self, ConfigError> {
        let error = |reason: String| ConfigError::Filter {
            expression: expression.to_string(),
            reason,
        };

        let tokens = tokenize(expression);
        if tokens.is_empty() {
            return Err(error("empty expression".into()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr().map_err(error)?;
        if let Some(extra) = parser.peek() {
            return Err(error(format!("unexpected token {extra:?}")));
        }

        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    /// Whether the packet passes
    #[inline]
    pub fn matches(&self, packet: &Packet) -> bool {
        self.root.matches(packet)
    }

    /// Source text
    pub fn as_str(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for PacketFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut chars = input.chars().peekable();

    let flush = |word: &mut String, tokens: &mut Vec<String>| {
        if !word.is_empty() {
            tokens.push(std::mem::take(word));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            '(' | ')' | '!' => {
                flush(&mut word, &mut tokens);
                tokens.push(c.to_string());
            }
            '&' | '|' if chars.peek() == Some(&c) => {
                chars.next();
                flush(&mut word, &mut tokens);
                tokens.push(format!("{c}{c}"));
            }
            _ => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

/// Tokens that open an address or port primitive
const QUALIFIERS: [&str; 5] = ["src", "dst", "host", "net", "port"];

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

type ParseResult<T> = Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Option<&str> {
        let token = self.tokens.get(self.pos).map(String::as_str);
        self.pos += 1;
        token
    }

    fn eat(&mut self, alternatives: &[&str]) -> bool {
        if self.peek().is_some_and(|t| alternatives.contains(&t)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.term()?;
        while self.eat(&["or", "||"]) {
            let rhs = self.term()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut lhs = self.unary()?;
        while self.eat(&["and", "&&"]) {
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat(&["not", "!"]) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&["("]) {
            let inner = self.expr()?;
            if !self.eat(&[")"]) {
                return Err("missing closing parenthesis".into());
            }
            return Ok(inner);
        }
        let transport = self.peek().is_some_and(|t| t == "tcp" || t == "udp");
        let primitive = Expr::Primitive(self.primitive()?);
        if transport && self.peek().is_some_and(|t| QUALIFIERS.contains(&t)) {
            let qualified = Expr::Primitive(self.primitive()?);
            return Ok(Expr::And(Box::new(primitive), Box::new(qualified)));
        }
        Ok(primitive)
    }

    fn primitive(&mut self) -> ParseResult<Primitive> {
        let token = self
            .next()
            .ok_or_else(|| "unexpected end of expression".to_string())?
            .to_string();

        match token.as_str() {
            "src" => self.qualified(Side::Src),
            "dst" => self.qualified(Side::Dst),
            "host" | "net" | "port" => {
                self.pos -= 1;
                self.qualified(Side::Either)
            }
            "tcp" => Ok(Primitive::Proto(6)),
            "udp" => Ok(Primitive::Proto(17)),
            "icmp" => Ok(Primitive::Icmp),
            "ip" => Ok(Primitive::Ip4),
            "ip6" => Ok(Primitive::Ip6),
            "vlan" => {
                let id = match self.peek().map(str::parse::<u16>) {
                    Some(Ok(id)) => {
                        self.pos += 1;
                        Some(id)
                    }
                    _ => None,
                };
                Ok(Primitive::Vlan(id))
            }
            "proto" => {
                let value = self.operand("proto")?;
                value
                    .parse::<u8>()
                    .map(Primitive::Proto)
                    .map_err(|_| format!("invalid protocol number {value:?}"))
            }
            other => other
                .parse::<IpAddr>()
                .map(|ip| Primitive::Host(Side::Either, ip))
                .map_err(|_| format!("unknown primitive {other:?}")),
        }
    }

    fn qualified(&mut self, side: Side) -> ParseResult<Primitive> {
        let keyword = self
            .next()
            .ok_or_else(|| "expected host, net or port".to_string())?
            .to_string();

        match keyword.as_str() {
            "host" => {
                let value = self.operand("host")?;
                value
                    .parse::<IpAddr>()
                    .map(|ip| Primitive::Host(side, ip))
                    .map_err(|_| format!("invalid host {value:?}"))
            }
            "net" => {
                let value = self.operand("net")?;
                value
                    .parse::<IpNetwork>()
                    .map(|net| Primitive::Net(side, net))
                    .map_err(|e| format!("invalid net {value:?}: {e}"))
            }
            "port" => {
                let value = self.operand("port")?;
                value
                    .parse::<u16>()
                    .map(|port| Primitive::Port(side, port))
                    .map_err(|_| format!("invalid port {value:?}"))
            }
            other => other
                .parse::<IpAddr>()
                .map(|ip| Primitive::Host(side, ip))
                .map_err(|_| format!("expected host, net or port, got {other:?}")),
        }
    }

    fn operand(&mut self, keyword: &str) -> ParseResult<String> {
        self.next()
            .map(str::to_string)
            .ok_or_else(|| format!("{keyword} requires a value"))
    }
}
