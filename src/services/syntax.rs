//! 公式语法校验 - 业务能力层
//!
//! 与引擎无关的纯校验：非空、禁用字符、括号结构、环境配对，最后交给渲染能力确认可渲染。

use regex::Regex;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// 不允许出现在识别结果中的字符
pub const FORBIDDEN_CHARS: [char; 5] = ['<', '>', '&', '%', '#'];

static CONTROL_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\([A-Za-z]+)").expect("CONTROL_WORD_RE regex should compile")
});

static ENVIRONMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(begin|end)\{([A-Za-z]+\*?)\}").expect("ENVIRONMENT_RE regex should compile")
});

static LEFT_RIGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(left|right)(?:[^A-Za-z]|$)").expect("LEFT_RIGHT_RE regex should compile")
});

static DANGLING_SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\^_]\s*(?:\}|$)").expect("DANGLING_SCRIPT_RE regex should compile")
});

/// 渲染器认识的控制序列
static KNOWN_COMMANDS: phf::Set<&'static str> = phf::phf_set! {
    "frac", "dfrac", "tfrac", "sqrt", "sum", "prod", "int", "iint", "iiint", "oint", "lim",
    "alpha", "beta", "gamma", "delta", "epsilon", "varepsilon", "zeta", "eta", "theta",
    "vartheta", "iota", "kappa", "lambda", "mu", "nu", "xi", "pi", "varpi", "rho", "varrho",
    "sigma", "varsigma", "tau", "upsilon", "phi", "varphi", "chi", "psi", "omega",
    "Gamma", "Delta", "Theta", "Lambda", "Xi", "Pi", "Sigma", "Upsilon", "Phi", "Psi", "Omega",
    "cdot", "times", "div", "pm", "mp", "ast", "star", "circ", "bullet", "oplus", "otimes", "odot",
    "leq", "geq", "neq", "le", "ge", "ne", "approx", "equiv", "sim", "simeq", "cong", "propto",
    "ll", "gg", "mid", "parallel", "perp", "angle", "triangle", "degree", "prime",
    "infty", "partial", "nabla", "ell", "hbar", "Re", "Im", "emptyset", "varnothing",
    "in", "notin", "ni", "subset", "subseteq", "supset", "supseteq", "cup", "cap", "setminus",
    "forall", "exists", "neg", "land", "lor", "because", "therefore", "not",
    "to", "rightarrow", "leftarrow", "Rightarrow", "Leftarrow", "leftrightarrow",
    "Leftrightarrow", "longrightarrow", "mapsto", "xrightarrow", "uparrow", "downarrow",
    "left", "right", "big", "Big", "bigg", "Bigg", "langle", "rangle", "lfloor", "rfloor",
    "lceil", "rceil", "lbrace", "rbrace", "vert", "Vert",
    "begin", "end", "text", "mathrm", "mathbf", "mathit", "mathbb", "mathcal", "operatorname",
    "sin", "cos", "tan", "cot", "sec", "csc", "arcsin", "arccos", "arctan",
    "sinh", "cosh", "tanh", "log", "ln", "lg", "exp", "max", "min", "sup", "inf",
    "det", "deg", "gcd", "dim", "mod", "bmod", "pmod",
    "overline", "underline", "hat", "widehat", "bar", "vec", "dot", "ddot", "tilde",
    "widetilde", "overrightarrow", "overleftarrow", "overbrace", "underbrace",
    "overset", "underset", "stackrel", "binom", "dbinom", "choose",
    "quad", "qquad", "cdots", "ldots", "dots", "vdots", "ddots",
    "displaystyle", "textstyle", "limits", "nolimits", "boxed", "color", "hline",
};

/// 公式语法错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error("公式为空")]
    Empty,

    #[error("包含禁用字符 '{0}'")]
    ForbiddenChar(char),

    #[error("花括号不平衡")]
    UnbalancedBraces,

    #[error("\\left 与 \\right 数量不匹配")]
    UnbalancedLeftRight,

    #[error("环境 {0} 未正确闭合")]
    UnmatchedEnvironment(String),

    #[error("公式无法渲染")]
    Unrenderable,
}

/// 公式渲染能力（外部协作方）
pub trait FormulaRenderer: Send + Sync {
    fn can_render(&self, latex: &str) -> bool;
}

/// 内置渲染检查：只接受已知控制序列，拒绝悬空的上下标
#[derive(Debug, Clone, Default)]
pub struct KnownCommandRenderer {
    extra_commands: Vec<String>,
}

impl KnownCommandRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加宏包提供的控制序列
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_commands.extend(commands.into_iter().map(Into::into));
        self
    }

    fn is_known(&self, command: &str) -> bool {
        KNOWN_COMMANDS.contains(command) || self.extra_commands.iter().any(|c| c == command)
    }
}

impl FormulaRenderer for KnownCommandRenderer {
    fn can_render(&self, latex: &str) -> bool {
        if DANGLING_SCRIPT_RE.is_match(latex) {
            return false;
        }
        CONTROL_WORD_RE
            .captures_iter(latex)
            .all(|caps| self.is_known(&caps[1]))
    }
}

/// 公式语法校验器
#[derive(Clone)]
pub struct SyntaxValidator {
    renderer: Arc<dyn FormulaRenderer>,
}

impl SyntaxValidator {
    pub fn new(renderer: Arc<dyn FormulaRenderer>) -> Self {
        Self { renderer }
    }

    pub fn validate(&self, latex: &str) -> Result<(), SyntaxError> {
        let latex = latex.trim();
        if latex.is_empty() {
            return Err(SyntaxError::Empty);
        }

        if let Some(c) = latex.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(SyntaxError::ForbiddenChar(c));
        }

        check_braces(latex)?;
        check_left_right(latex)?;
        check_environments(latex)?;

        if !self.renderer.can_render(latex) {
            return Err(SyntaxError::Unrenderable);
        }

        Ok(())
    }

    pub fn is_valid(&self, latex: &str) -> bool {
        self.validate(latex).is_ok()
    }
}

impl Default for SyntaxValidator {
    fn default() -> Self {
        Self::new(Arc::new(KnownCommandRenderer::new()))
    }
}

/// 未转义的花括号必须平衡，且任何前缀都不能出现多余的右括号
fn check_braces(latex: &str) -> Result<(), SyntaxError> {
    let mut depth: i64 = 0;
    let mut chars = latex.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SyntaxError::UnbalancedBraces);
                }
            }
            _ => {}
        }
    }

    if depth == 0 {
        Ok(())
    } else {
        Err(SyntaxError::UnbalancedBraces)
    }
}

fn check_left_right(latex: &str) -> Result<(), SyntaxError> {
    let mut open: i64 = 0;
    for caps in LEFT_RIGHT_RE.captures_iter(latex) {
        if &caps[1] == "left" {
            open += 1;
        } else {
            open -= 1;
            if open < 0 {
                return Err(SyntaxError::UnbalancedLeftRight);
            }
        }
    }
    if open == 0 {
        Ok(())
    } else {
        Err(SyntaxError::UnbalancedLeftRight)
    }
}

fn check_environments(latex: &str) -> Result<(), SyntaxError> {
    let mut stack: Vec<&str> = Vec::new();
    for caps in ENVIRONMENT_RE.captures_iter(latex) {
        let name = caps.get(2).map_or("", |m| m.as_str());
        if &caps[1] == "begin" {
            stack.push(name);
        } else if stack.pop() != Some(name) {
            return Err(SyntaxError::UnmatchedEnvironment(name.to_string()));
        }
    }
    match stack.pop() {
        Some(name) => Err(SyntaxError::UnmatchedEnvironment(name.to_string())),
        None => Ok(()),
    }
}
