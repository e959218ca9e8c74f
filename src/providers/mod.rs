pub mod douyin;
