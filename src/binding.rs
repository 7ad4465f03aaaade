//! ネットワークの入出力 (バインディング) に関するモジュール

use std::fmt;

use serde::{Deserialize, Serialize};

/// テンソルの次元 (CHW など) を表す構造体
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dims(pub Vec<usize>);

impl Dims {
    /// CHW形式の3次元を作成します。
    pub fn chw(channels: usize, height: usize, width: usize) -> Self {
        Self(vec![channels, height, width])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// 全要素数を返します。
    pub fn volume(&self) -> usize {
        self.0.iter().product()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for Dims {
    fn from(v: Vec<usize>) -> Self {
        Self(v)
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", parts.join("x"))
    }
}

/// バインディングおよびメモリプールの論理的な役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Input,
    Output,
}

impl Role {
    pub(crate) fn index(self) -> usize {
        match self {
            Role::Input => 0,
            Role::Output => 1,
        }
    }
}

/// 名前付きの入出力スロット
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    /// レイヤ (テンソル) 名
    pub name: String,
    /// 次元
    pub dims: Dims,
    /// 1要素あたりのバイト数
    pub element_size: usize,
    /// 入力か出力か
    pub role: Role,
}

impl NetworkBinding {
    pub fn new<S: Into<String>>(name: S, dims: Dims, element_size: usize, role: Role) -> Self {
        Self {
            name: name.into(),
            dims,
            element_size,
            role,
        }
    }

    /// 1サンプル分のバイト数を返します。
    pub fn sample_bytes(&self) -> usize {
        self.dims.volume() * self.element_size
    }
}

/// バインディングを「入力を登録順，続いて出力を登録順」に並べ替えます。
///
/// # Args
/// * `inputs` - 入力バインディング
/// * `outputs` - 出力バインディング
///
/// # Return
/// * エンジンのバインディング順序
pub fn ordered_bindings(inputs: &[NetworkBinding], outputs: &[NetworkBinding]) -> Vec<NetworkBinding> {
    inputs.iter().chain(outputs.iter()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_and_bytes() {
        let b = NetworkBinding::new("data", Dims::chw(3, 4, 5), 4, Role::Input);
        assert_eq!(b.dims.volume(), 60);
        assert_eq!(b.sample_bytes(), 240);
        assert_eq!(b.dims.to_string(), "3x4x5");
    }

    #[test]
    fn inputs_come_first() {
        let i = NetworkBinding::new("data", Dims::chw(3, 2, 2), 4, Role::Input);
        let o1 = NetworkBinding::new("coverage", Dims::chw(1, 1, 1), 4, Role::Output);
        let o2 = NetworkBinding::new("bboxes", Dims::chw(4, 1, 1), 4, Role::Output);
        let names: Vec<_> = ordered_bindings(&[i], &[o1, o2])
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, ["data", "coverage", "bboxes"]);
    }
}
